use super::{CaptureError, CapturedFrame, FrameSource};
use async_trait::async_trait;
use image::{ImageFormat, ImageReader};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Replays the JPEG files of a directory in name order, looping forever
pub struct DirectoryFrameSource {
    frames: Vec<PathBuf>,
    next: AtomicUsize,
}

impl DirectoryFrameSource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let dir = dir.as_ref();
        let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_jpeg(path))
            .collect();
        frames.sort();

        if frames.is_empty() {
            return Err(CaptureError::Unavailable(format!(
                "no JPEG frames in {}",
                dir.display()
            )));
        }

        log::info!("📁 Loaded {} frames from {}", frames.len(), dir.display());
        Ok(Self {
            frames,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[async_trait]
impl FrameSource for DirectoryFrameSource {
    async fn capture(&self) -> Result<CapturedFrame, CaptureError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.frames.len();
        let path = &self.frames[index];

        let jpeg = tokio::fs::read(path).await?;
        if jpeg.is_empty() {
            return Err(CaptureError::Empty);
        }

        let (width, height) = ImageReader::with_format(Cursor::new(&jpeg), ImageFormat::Jpeg)
            .into_dimensions()
            .map_err(|e| CaptureError::InvalidFrame(format!("{}: {}", path.display(), e)))?;

        log::trace!("Read frame {} ({}x{}, {} bytes)", path.display(), width, height, jpeg.len());
        Ok(CapturedFrame::new(jpeg, width, height))
    }
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false)
}
