//! Output sinks for clear fMP4 data.
//!
//! The pipeline writes the cleared init segment followed by every cleared
//! media segment, then calls [`Muxer::finish`] exactly once on success.
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};
use crate::utils::{ensure_parent_dir, get_binary_path};

/// Destination of the clear stream.
pub trait Muxer {
    /// Append the next chunk, in stream order.
    fn write(&mut self, data: &[u8]) -> Result<()>;
    /// Complete the output. Only called after every chunk was written.
    fn finish(&mut self) -> Result<()>;
}

impl Muxer for Vec<u8> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<M: Muxer + ?Sized> Muxer for Box<M> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Writes the stream to a file.
///
/// Data goes to `<path>.part` and is renamed into place by `finish`; an
/// unfinished part file is removed on drop.
#[derive(Debug)]
pub struct FileMuxer {
    path: PathBuf,
    part_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileMuxer {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_parent_dir(&path)?;

        let mut part = path.clone().into_os_string();
        part.push(".part");
        let part_path = PathBuf::from(part);
        let file = File::create(&part_path)
            .map_err(|e| Error::Mux(format!("Cannot create {}: {}", part_path.display(), e)))?;

        Ok(Self {
            path,
            part_path,
            writer: Some(BufWriter::new(file)),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Muxer for FileMuxer {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Mux("Write after finish".to_string()))?;
        writer.write_all(data)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| Error::Mux("Muxer already finished".to_string()))?;
        writer.flush()?;
        drop(writer);
        fs::rename(&self.part_path, &self.path)?;
        debug!("Wrote {}", self.path.display());
        Ok(())
    }
}

impl Drop for FileMuxer {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.part_path);
        }
    }
}

/// Pipes the stream into `ffmpeg`, stream-copying into the output container.
///
/// ffmpeg writes `<stem>.part.<ext>`, which keeps the extension it picks the
/// container from. `finish` renames it into place; an unfinished or failed
/// run leaves nothing behind.
#[derive(Debug)]
pub struct FfmpegMuxer {
    output: PathBuf,
    part_path: PathBuf,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
}

impl FfmpegMuxer {
    /// Spawn `ffmpeg` from PATH writing to `output`.
    pub fn spawn(output: impl AsRef<Path>) -> Result<Self> {
        let binary = get_binary_path(&["ffmpeg"])
            .ok_or_else(|| Error::Mux("ffmpeg not found on PATH".to_string()))?;
        Self::spawn_with(&binary, output)
    }

    /// Spawn `binary` with ffmpeg's command line, writing to `output`.
    pub fn spawn_with(binary: &Path, output: impl AsRef<Path>) -> Result<Self> {
        let output = output.as_ref().to_path_buf();
        ensure_parent_dir(&output)?;
        let part_path = part_path_keeping_extension(&output);

        info!("Muxing with {} into {}", binary.display(), output.display());
        let mut child = Command::new(binary)
            .args(["-y", "-loglevel", "error", "-i", "pipe:0", "-c", "copy"])
            .arg(&part_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Mux(format!("Failed to start {}: {}", binary.display(), e)))?;
        let stdin = child.stdin.take();
        // read on a thread; a full stderr pipe would stall ffmpeg
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        Ok(Self {
            output,
            part_path,
            child,
            stdin,
            stderr,
        })
    }

    fn collect_stderr(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}

fn part_path_keeping_extension(output: &Path) -> PathBuf {
    match (output.file_stem(), output.extension()) {
        (Some(stem), Some(ext)) => {
            let mut name = stem.to_os_string();
            name.push(".part.");
            name.push(ext);
            output.with_file_name(name)
        }
        _ => {
            let mut name = output.as_os_str().to_os_string();
            name.push(".part");
            PathBuf::from(name)
        }
    }
}

impl Muxer for FfmpegMuxer {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Mux("Write after finish".to_string()))?;
        stdin
            .write_all(data)
            .map_err(|e| Error::Mux(format!("ffmpeg rejected input: {}", e)))
    }

    fn finish(&mut self) -> Result<()> {
        if self.stdin.take().is_none() {
            return Err(Error::Mux("Muxer already finished".to_string()));
        }
        let status = self.child.wait();
        let stderr = self.collect_stderr();
        let status = match status {
            Ok(status) if status.success() => status,
            Ok(status) => {
                let _ = fs::remove_file(&self.part_path);
                return Err(Error::Mux(format!(
                    "ffmpeg exited with {}: {}",
                    status,
                    stderr.trim()
                )));
            }
            Err(err) => {
                let _ = fs::remove_file(&self.part_path);
                return Err(err.into());
            }
        };
        fs::rename(&self.part_path, &self.output)?;
        debug!("ffmpeg ({}) wrote {}", status, self.output.display());
        Ok(())
    }
}

impl Drop for FfmpegMuxer {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
            self.collect_stderr();
            let _ = fs::remove_file(&self.part_path);
        }
    }
}
