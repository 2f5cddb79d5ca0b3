//! Frame acquisition backends
//!
//! A [`FrameSource`] hands back one encoded JPEG at a time. The capture loop
//! owns exactly one source for its lifetime and never shares it across
//! threads, so implementations are free to keep subprocess or device handles.

use std::io::Read;
use std::process::{Child, Command, Stdio};

use crate::{Error, Result};

/// JPEG start-of-image marker
const SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker
const EOI: [u8; 2] = [0xFF, 0xD9];

/// A frame past this size without an EOI means the stream is garbage
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Produces encoded JPEG frames for one camera
pub trait FrameSource: Send {
    /// Grab the next frame
    ///
    /// `Ok(None)` means no frame was available right now; the capture loop
    /// keeps the previous frame and tries again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Camera`] when the underlying device or subprocess
    /// fails. The capture loop logs and retries.
    fn grab(&mut self) -> Result<Option<Vec<u8>>>;

    /// Release device handles; called once when the feed stops
    fn close(&mut self) {}
}

/// Reads MJPEG frames from an `ffmpeg` subprocess attached to a V4L2 device
pub struct FfmpegSource {
    device: String,
    width: u32,
    height: u32,
    child: Option<Child>,
    /// Bytes read past the previous frame's EOI; the head of the next frame
    carry: Vec<u8>,
}

impl FfmpegSource {
    #[must_use]
    pub fn new(device: String, width: u32, height: u32) -> Self {
        Self {
            device,
            width,
            height,
            child: None,
            carry: Vec::new(),
        }
    }

    fn spawn(&self) -> Result<Child> {
        Command::new("ffmpeg")
            .args([
                "-loglevel",
                "error",
                "-f",
                "v4l2",
                "-video_size",
                &format!("{}x{}", self.width, self.height),
                "-i",
                &self.device,
                "-f",
                "mjpeg",
                "-q:v",
                "5",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Camera(format!("failed to start ffmpeg for {}: {e}", self.device)))
    }
}

/// Pull bytes from `reader` until a whole JPEG (SOI..EOI) is assembled
///
/// Reads rarely align with frame boundaries, so everything past the EOI is
/// left in `carry` to seed the next call; anything before the SOI (stderr
/// noise, a torn first frame) is stripped.
fn next_frame(reader: &mut impl Read, carry: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
    let mut frame = std::mem::take(carry);
    let mut buf = [0u8; 4096];
    loop {
        if let Some(end) = frame.windows(2).position(|w| w == EOI) {
            *carry = frame.split_off(end + 2);
            match frame.windows(2).position(|w| w == SOI) {
                Some(start) => {
                    frame.drain(..start);
                    return Ok(Some(frame));
                }
                // A run with an EOI but no SOI is garbage; scan on
                None => {
                    frame = std::mem::take(carry);
                    continue;
                }
            }
        }
        if frame.len() > MAX_FRAME_BYTES {
            return Err(Error::Camera("frame exceeded 8 MiB without EOI".to_string()));
        }

        let n = reader
            .read(&mut buf)
            .map_err(|e| Error::Camera(format!("ffmpeg read failed: {e}")))?;
        if n == 0 {
            return Ok(None);
        }
        frame.extend_from_slice(&buf[..n]);
    }
}

impl FrameSource for FfmpegSource {
    fn grab(&mut self) -> Result<Option<Vec<u8>>> {
        if self.child.is_none() {
            self.carry.clear();
            self.child = Some(self.spawn()?);
        }
        let stdout = self
            .child
            .as_mut()
            .and_then(|child| child.stdout.as_mut())
            .ok_or_else(|| Error::Camera("ffmpeg stdout is not piped".to_string()))?;

        match next_frame(stdout, &mut self.carry) {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                // EOF: the subprocess died, respawn on the next grab
                self.close();
                Ok(None)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    fn close(&mut self) {
        self.carry.clear();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut frame = SOI.to_vec();
        frame.extend_from_slice(body);
        frame.extend_from_slice(&EOI);
        frame
    }

    #[test]
    fn consecutive_frames_survive_unaligned_reads() {
        let first = jpeg(&[1, 2, 3]);
        let second = jpeg(&[4, 5, 6, 7]);
        let mut pipe = Cursor::new([first.clone(), second.clone()].concat());
        let mut carry = Vec::new();

        // One read pulls both frames; the second must come back intact from
        // the carry, not headless
        assert_eq!(next_frame(&mut pipe, &mut carry).unwrap(), Some(first));
        assert_eq!(next_frame(&mut pipe, &mut carry).unwrap(), Some(second));
        assert_eq!(next_frame(&mut pipe, &mut carry).unwrap(), None);
    }

    #[test]
    fn bytes_before_the_soi_are_stripped() {
        let frame = jpeg(&[9, 9]);
        let mut data = vec![0x00, 0x11, 0x22];
        data.extend_from_slice(&frame);
        let mut pipe = Cursor::new(data);
        let mut carry = Vec::new();

        assert_eq!(next_frame(&mut pipe, &mut carry).unwrap(), Some(frame));
    }

    #[test]
    fn a_frame_already_in_the_carry_needs_no_read() {
        let frame = jpeg(&[5]);
        let mut pipe = Cursor::new(Vec::new());
        let mut carry = frame.clone();

        assert_eq!(next_frame(&mut pipe, &mut carry).unwrap(), Some(frame));
        assert!(carry.is_empty());
    }

    #[test]
    fn eof_mid_frame_returns_none() {
        let mut partial = SOI.to_vec();
        partial.extend_from_slice(&[1, 2, 3]);
        let mut pipe = Cursor::new(partial);
        let mut carry = Vec::new();

        assert_eq!(next_frame(&mut pipe, &mut carry).unwrap(), None);
    }
}
