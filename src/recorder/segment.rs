use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use super::CompletedFile;
use crate::core::error::{MuxError, MuxResult};
use crate::core::timestamp::{format_file_stamp, pts_to_utc_ns};
use crate::mpegts::TsWriter;

const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// One output file under its temporary name plus its bookkeeping.
pub struct Segment {
    index: u64,
    tmp_path: PathBuf,
    writer: TsWriter<BufWriter<File>>,
    bytes_written: u64,
    units: u64,
    start_pts: Option<i64>,
    start_utc_ns: u64,
    end_utc_ns: u64,
}

impl Segment {
    pub fn create(base: &Path, index: u64) -> MuxResult<Self> {
        let tmp_path = tmp_path(base);
        let file = File::create(&tmp_path).map_err(|e| MuxError::io("create", &tmp_path, e))?;

        Ok(Self {
            index,
            tmp_path,
            writer: TsWriter::new(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file)),
            bytes_written: 0,
            units: 0,
            start_pts: None,
            start_utc_ns: 0,
            end_utc_ns: 0,
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn units(&self) -> u64 {
        self.units
    }

    pub fn start_utc_ns(&self) -> u64 {
        self.start_utc_ns
    }

    pub fn end_utc_ns(&self) -> u64 {
        self.end_utc_ns
    }

    /// Writes one unit. The first unit anchors PTS to `now_utc_ns`.
    pub fn write(
        &mut self,
        pts: i64,
        dts: i64,
        random_access: bool,
        nalus: &[Bytes],
        now_utc_ns: u64,
        clock_rate: u32,
    ) -> MuxResult<u64> {
        let wall = match self.start_pts {
            None => {
                self.start_pts = Some(pts);
                self.start_utc_ns = now_utc_ns;
                now_utc_ns
            }
            Some(start_pts) => pts_to_utc_ns(pts, start_pts, self.start_utc_ns, clock_rate),
        };

        let n = self
            .writer
            .write_access_unit(pts, dts, random_access, nalus)
            .map_err(|e| MuxError::io("write", &self.tmp_path, e))?;

        self.bytes_written += n;
        self.units += 1;
        self.end_utc_ns = wall.max(self.end_utc_ns);
        Ok(n)
    }

    /// Flushes and closes the file, then renames it after its wall-clock
    /// coverage. A segment without units is removed instead.
    pub fn finish(self, base: &Path, camera: &str) -> MuxResult<Option<CompletedFile>> {
        let Segment {
            index,
            tmp_path,
            writer,
            bytes_written,
            units,
            start_utc_ns,
            end_utc_ns,
            ..
        } = self;

        let mut buffered = writer.into_inner();
        buffered
            .flush()
            .map_err(|e| MuxError::io("flush", &tmp_path, e))?;
        let file = buffered
            .into_inner()
            .map_err(|e| MuxError::io("flush", &tmp_path, e.into_error()))?;
        file.sync_all()
            .map_err(|e| MuxError::io("sync", &tmp_path, e))?;
        drop(file);

        if units == 0 {
            match fs::remove_file(&tmp_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(MuxError::io("remove", &tmp_path, e)),
            }
            return Ok(None);
        }

        let final_path = final_path(base, start_utc_ns, end_utc_ns, index);
        fs::rename(&tmp_path, &final_path).map_err(|e| MuxError::io("rename", &tmp_path, e))?;

        Ok(Some(CompletedFile {
            camera: camera.to_string(),
            path: final_path,
            start_utc_ns,
            end_utc_ns,
            bytes: bytes_written,
            units,
        }))
    }
}

/// `<base>_tmp.ts`
pub fn tmp_path(base: &Path) -> PathBuf {
    with_suffix(base, "_tmp.ts")
}

/// `<base>_<start>_<end>.ts`, or `<base>_<start>_<end>_<index>.ts` when a
/// previous segment already covered the same seconds.
pub fn final_path(base: &Path, start_utc_ns: u64, end_utc_ns: u64, index: u64) -> PathBuf {
    let stamp = format!(
        "_{}_{}",
        format_file_stamp(start_utc_ns),
        format_file_stamp(end_utc_ns)
    );
    let candidate = with_suffix(base, &format!("{}.ts", stamp));
    if candidate.exists() {
        with_suffix(base, &format!("{}_{}.ts", stamp, index))
    } else {
        candidate
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
