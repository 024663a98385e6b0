//! Camera capability.
//!
//! The pipeline never holds an ambient camera handle; whoever drives a
//! capture passes a [`Camera`] in at call time. Backends either shell out
//! to an external still tool (the usual setup on a Raspberry Pi) or pick
//! up frames another process drops into a spool directory.

use image::RgbImage;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::CameraSettings;
use crate::error::CaptureError;

/// One frame on demand. Implementations block until the frame is ready.
pub trait Camera {
    fn acquire_frame(&mut self) -> Result<RgbImage, CaptureError>;
}

/// Drives an external still-capture program (`rpicam-still`, `libcamera-still`,
/// `fswebcam`, ...) that writes a JPEG to the path we hand it.
pub struct CommandCamera {
    program: String,
    settings: CameraSettings,
    work_dir: PathBuf,
}

impl CommandCamera {
    /// `work_dir` receives the transient capture file; the data tree's
    /// `temp/` directory is the usual choice.
    pub fn new(program: impl Into<String>, settings: CameraSettings, work_dir: PathBuf) -> Self {
        Self {
            program: program.into(),
            settings,
            work_dir,
        }
    }
}

impl Camera for CommandCamera {
    fn acquire_frame(&mut self) -> Result<RgbImage, CaptureError> {
        std::fs::create_dir_all(&self.work_dir)
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
        let out = self
            .work_dir
            .join(format!("frame_{}.jpg", std::process::id()));

        let status = Command::new(&self.program)
            .arg("--width")
            .arg(self.settings.width.to_string())
            .arg("--height")
            .arg(self.settings.height.to_string())
            .arg("--nopreview")
            .arg("--output")
            .arg(&out)
            .status()
            .map_err(|e| {
                CaptureError::DeviceUnavailable(format!("{}: {}", self.program, e))
            })?;

        if !status.success() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} exited with {}",
                self.program, status
            )));
        }

        let frame = decode_frame(&out)?;
        let _ = std::fs::remove_file(&out);
        Ok(frame)
    }
}

/// Reads the most recently modified image file from a spool directory that
/// some other process (a motion daemon, a network drop) keeps filled.
pub struct SpoolCamera {
    dir: PathBuf,
}

impl SpoolCamera {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl Camera for SpoolCamera {
    fn acquire_frame(&mut self) -> Result<RgbImage, CaptureError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            CaptureError::DeviceUnavailable(format!("{}: {}", self.dir.display(), e))
        })?;

        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || !is_image_file(&path) {
                continue;
            }
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            if newest.as_ref().map(|(t, _)| mtime > *t).unwrap_or(true) {
                newest = Some((mtime, path));
            }
        }

        match newest {
            Some((_, path)) => decode_frame(&path),
            None => Err(CaptureError::NoFrame),
        }
    }
}

fn is_image_file(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    matches!(ext.as_str(), "jpg" | "jpeg" | "png")
}

fn decode_frame(path: &Path) -> Result<RgbImage, CaptureError> {
    if !path.exists() {
        return Err(CaptureError::NoFrame);
    }
    match image::open(path) {
        Ok(img) => Ok(img.to_rgb8()),
        Err(_) => Err(CaptureError::NoFrame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_spool_camera_picks_an_image() {
        let dir = tempdir().unwrap();
        let img = RgbImage::from_pixel(8, 6, image::Rgb([10, 200, 30]));
        img.save(dir.path().join("frame.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();

        let mut camera = SpoolCamera::new(dir.path().to_path_buf());
        let frame = camera.acquire_frame().unwrap();
        assert_eq!(frame.dimensions(), (8, 6));
    }

    #[test]
    fn test_spool_camera_empty_dir_is_no_frame() {
        let dir = tempdir().unwrap();
        let mut camera = SpoolCamera::new(dir.path().to_path_buf());
        assert!(matches!(camera.acquire_frame(), Err(CaptureError::NoFrame)));
    }

    #[test]
    fn test_spool_camera_missing_dir_is_device_unavailable() {
        let dir = tempdir().unwrap();
        let mut camera = SpoolCamera::new(dir.path().join("nope"));
        assert!(matches!(
            camera.acquire_frame(),
            Err(CaptureError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_command_camera_missing_program() {
        let dir = tempdir().unwrap();
        let mut camera = CommandCamera::new(
            "plantcam-no-such-capture-tool",
            CameraSettings::default(),
            dir.path().to_path_buf(),
        );
        assert!(matches!(
            camera.acquire_frame(),
            Err(CaptureError::DeviceUnavailable(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_camera_program_without_output_is_no_frame() {
        let dir = tempdir().unwrap();
        let mut camera = CommandCamera::new(
            "true",
            CameraSettings::default(),
            dir.path().to_path_buf(),
        );
        assert!(matches!(camera.acquire_frame(), Err(CaptureError::NoFrame)));
    }
}
