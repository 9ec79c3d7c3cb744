//! Local raw-video frame source.
//!
//! Reads back-to-back RGB24 frames of a fixed size from a local file, the format produced
//! by `ffmpeg -f rawvideo -pix_fmt rgb24`. Capture time is the read time.
//!
//! The file source MUST NOT fetch remote URLs.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::{FrameSource, SourceFailure};
use crate::frame::{Frame, FrameClock, RGB_CHANNELS};
use crate::now_ms;

pub struct FileSource {
    path: PathBuf,
    name: String,
    width: u32,
    height: u32,
    reader: Option<BufReader<File>>,
    clock: FrameClock,
    frames_read: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>, width: u32, height: u32) -> Result<Self, SourceFailure> {
        let path = path.as_ref().to_path_buf();
        let reader = open_reader(&path)?;
        log::info!(
            "FileSource: reading {} as {}x{} RGB24",
            path.display(),
            width,
            height
        );
        Ok(Self {
            name: path.display().to_string(),
            path,
            width,
            height,
            reader: Some(reader),
            clock: FrameClock::new(),
            frames_read: 0,
        })
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * RGB_CHANNELS
    }
}

fn open_reader(path: &Path) -> Result<BufReader<File>, SourceFailure> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| SourceFailure::Unreachable(format!("{}: {}", path.display(), e)))
}

impl FrameSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next(&mut self) -> Result<Option<Frame>, SourceFailure> {
        let frame_len = self.frame_len();
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| SourceFailure::Unreachable(format!("{}: not open", self.name)))?;

        let mut pixels = vec![0u8; frame_len];
        match reader.read_exact(&mut pixels) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                log::info!(
                    "FileSource: end of {} after {} frames",
                    self.name,
                    self.frames_read
                );
                return Ok(None);
            }
            Err(e) => {
                self.reader = None;
                return Err(SourceFailure::Read(format!("{}: {}", self.name, e)));
            }
        }
        self.frames_read += 1;
        self.clock
            .frame(now_ms(), self.width, self.height, pixels)
            .map(Some)
            .map_err(|e| SourceFailure::Read(e.to_string()))
    }

    /// Reopen the file and continue after the last complete frame.
    fn reconnect(&mut self) -> Result<(), SourceFailure> {
        let mut reader = open_reader(&self.path)?;
        let offset = self.frames_read * self.frame_len() as u64;
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| SourceFailure::Read(format!("{}: {}", self.name, e)))?;
        self.reader = Some(reader);
        Ok(())
    }
}
