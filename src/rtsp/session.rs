use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use retina::client::{
    Credentials, Described, PacketItem, PlayOptions, Session, SessionGroup, SessionOptions,
    SetupOptions, TcpTransportOptions, Transport, UdpTransportOptions,
};
use retina::codec::ParametersRef;
use tokio::net::TcpStream;
use url::Url;

use super::{
    MediaDescription, PacketSink, PtsClock, SessionState, SessionStopper, StreamSource,
    TransportKind, DEFAULT_RTSP_PORT,
};
use crate::core::error::{SessionError, SessionResult};
use crate::core::lock::lock_mutex;
use crate::core::logging::{ComponentLogger, LogContext};
use crate::h264::parse_avcc;
use crate::rtp::RtpPacket;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = "cam-stream-recorder";

/// RTSP/RTP session with one camera, video only.
pub struct RtspSession {
    name: String,
    url: Url,
    creds: Option<Credentials>,
    transport: TransportKind,
    connect_timeout: Duration,
    state: Arc<Mutex<SessionState>>,
    stopper: SessionStopper,
    group: Arc<SessionGroup>,
    described: Option<Session<Described>>,
    media: Option<MediaDescription>,
}

impl RtspSession {
    /// Credentials embedded in `url` are moved out of it and sent on
    /// authentication challenges only.
    pub fn new(name: impl Into<String>, url: &Url, transport: TransportKind) -> Self {
        let (url, creds) = split_credentials(url);
        Self {
            name: name.into(),
            url,
            creds,
            transport,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            state: Arc::new(Mutex::new(SessionState::Created)),
            stopper: SessionStopper::new(),
            group: Arc::new(SessionGroup::default()),
            described: None,
            media: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn set_state(&self, state: SessionState) {
        *lock_mutex(&self.state, "rtsp session state") = state;
    }

    fn require(&self, operation: &'static str, expected: SessionState) -> SessionResult<()> {
        lock_mutex(&self.state, "rtsp session state").require(operation, expected)
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        self.described = None;
        self.set_state(SessionState::Failed(err.to_string()));
        self.warn(&err.to_string());
        err
    }

    fn retina_transport(&self) -> Transport {
        match self.transport {
            TransportKind::Tcp => Transport::Tcp(TcpTransportOptions::default()),
            TransportKind::Udp => Transport::Udp(UdpTransportOptions::default()),
        }
    }

    /// Plain TCP reachability check, so a dead camera is reported as such
    /// instead of as an RTSP failure.
    async fn probe(&self) -> SessionResult<()> {
        let target = self.url.host_str().unwrap_or_default().to_string();
        let port = self.url.port().unwrap_or(DEFAULT_RTSP_PORT);
        let endpoint = format!("{}:{}", target, port);

        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((target.as_str(), port)))
            .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(source)) => Err(SessionError::Unreachable {
                target: endpoint,
                source,
            }),
            Err(_) => Err(SessionError::ConnectTimeout { target: endpoint }),
        }
    }

    async fn describe(&mut self) -> SessionResult<MediaDescription> {
        self.probe().await?;

        let options = SessionOptions::default()
            .creds(self.creds.clone())
            .session_group(self.group.clone())
            .user_agent(USER_AGENT.to_owned());

        let session =
            match tokio::time::timeout(self.connect_timeout, Session::describe(self.url.clone(), options))
                .await
            {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => return Err(SessionError::protocol(format!("DESCRIBE failed: {}", e))),
                Err(_) => {
                    return Err(SessionError::ConnectTimeout {
                        target: self.url.to_string(),
                    });
                }
            };

        let media = select_h264(&session)?;
        self.described = Some(session);
        Ok(media)
    }

    async fn stream_into(&mut self, sink: &mut dyn PacketSink) -> SessionResult<()> {
        let Some(session) = self.described.take() else {
            return Err(SessionError::protocol("session lost before PLAY"));
        };
        let clock_rate = self
            .media
            .as_ref()
            .map(|m| m.clock_rate)
            .unwrap_or(crate::recorder::H264_CLOCK_RATE);

        let playing = session
            .play(PlayOptions::default())
            .await
            .map_err(|e| SessionError::protocol(format!("PLAY failed: {}", e)))?;
        self.set_state(SessionState::Playing);
        self.info("playing");

        let mut packets = Box::pin(playing);
        let mut clock = PtsClock::new(clock_rate);
        let stopper = self.stopper.clone();

        let result = loop {
            tokio::select! {
                _ = stopper.stopped() => break Ok(()),
                item = packets.next() => match item {
                    None => {
                        self.info("camera ended the stream");
                        break Ok(());
                    }
                    Some(Err(e)) => break Err(SessionError::transport(e.to_string())),
                    Some(Ok(PacketItem::Rtp(pkt))) => {
                        let Some(pts) = clock.to_pts(pkt.timestamp().timestamp()) else {
                            continue;
                        };
                        let packet = RtpPacket {
                            payload: Bytes::copy_from_slice(pkt.payload()),
                            pts,
                            marker: pkt.mark(),
                            sequence: pkt.sequence_number(),
                        };
                        if let Err(e) = sink.on_packet(packet) {
                            break Err(SessionError::Sink(e));
                        }
                    }
                    Some(Ok(_)) => {}
                },
            }
        };

        // dropping the playing session schedules TEARDOWN on the group
        drop(packets);
        self.teardown().await;
        result
    }

    async fn teardown(&self) {
        match tokio::time::timeout(TEARDOWN_TIMEOUT, self.group.await_teardown()).await {
            Ok(Ok(())) => self.debug("teardown complete"),
            Ok(Err(e)) => self.warn(&format!("teardown failed: {}", e)),
            Err(_) => self.warn("teardown timed out"),
        }
    }
}

#[async_trait]
impl StreamSource for RtspSession {
    async fn connect(&mut self) -> SessionResult<MediaDescription> {
        self.require("connect", SessionState::Created)?;
        self.debug(&format!("connecting to {}", self.url));

        match self.describe().await {
            Ok(media) => {
                self.info(&format!(
                    "found {} stream {} at {} Hz",
                    media.encoding, media.stream_index, media.clock_rate
                ));
                self.media = Some(media.clone());
                self.set_state(SessionState::Connected);
                Ok(media)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn setup(&mut self) -> SessionResult<()> {
        self.require("setup", SessionState::Connected)?;
        let stream_index = match &self.media {
            Some(media) => media.stream_index,
            None => return Err(self.fail(SessionError::protocol("no media selected"))),
        };
        let transport = self.retina_transport();

        let Some(session) = self.described.as_mut() else {
            return Err(self.fail(SessionError::protocol("session lost before SETUP")));
        };
        let result = session
            .setup(stream_index, SetupOptions::default().transport(transport))
            .await;
        if let Err(e) = result {
            return Err(self.fail(SessionError::protocol(format!("SETUP failed: {}", e))));
        }

        self.set_state(SessionState::Configured);
        self.debug(&format!("set up over {}", self.transport));
        Ok(())
    }

    async fn play(&mut self, sink: &mut dyn PacketSink) -> SessionResult<()> {
        self.require("play", SessionState::Configured)?;

        match self.stream_into(sink).await {
            Ok(()) => {
                self.set_state(SessionState::Stopped);
                self.info("stopped");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn stop(&mut self) {
        self.stopper.stop();
        // an unplayed session tears down when dropped
        self.described = None;
        let mut state = lock_mutex(&self.state, "rtsp session state");
        if !state.is_terminal() {
            *state = SessionState::Stopped;
        }
    }

    fn stopper(&self) -> SessionStopper {
        self.stopper.clone()
    }

    fn state(&self) -> SessionState {
        lock_mutex(&self.state, "rtsp session state").clone()
    }
}

impl ComponentLogger for RtspSession {
    fn log_context(&self) -> LogContext {
        LogContext::new("rtsp", &self.name)
    }
}

fn select_h264(session: &Session<Described>) -> SessionResult<MediaDescription> {
    let streams = session.streams();
    let found = streams.iter().enumerate().find(|(_, s)| {
        s.media() == "video" && s.encoding_name().eq_ignore_ascii_case("h264")
    });

    let Some((stream_index, stream)) = found else {
        let offered = streams
            .iter()
            .map(|s| format!("{}/{}", s.media(), s.encoding_name()))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(SessionError::UnsupportedMedia { offered });
    };

    let parameter_sets = match stream.parameters() {
        Some(ParametersRef::Video(video)) => parse_avcc(video.extra_data()).unwrap_or_default(),
        _ => Default::default(),
    };

    Ok(MediaDescription {
        stream_index,
        encoding: stream.encoding_name().to_string(),
        clock_rate: stream.clock_rate_hz(),
        control: stream.control().map(|u| u.to_string()),
        parameter_sets,
    })
}

/// Returns `url` without user info, plus the credentials it carried.
pub fn split_credentials(url: &Url) -> (Url, Option<Credentials>) {
    if url.username().is_empty() {
        return (url.clone(), None);
    }

    let creds = Credentials {
        username: url.username().to_string(),
        password: url.password().unwrap_or_default().to_string(),
    };
    let mut stripped = url.clone();
    // only fails for cannot-be-a-base URLs, which carry no user info
    let _ = stripped.set_username("");
    let _ = stripped.set_password(None);
    (stripped, Some(creds))
}
