#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use latex_ocr_lib::{Notice, Notifier};

/// Collects notices for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn take(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.notices.lock().unwrap())
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

/// A small non-empty PNG-looking file.
pub fn write_image(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"\x89PNG\r\n\x1a\nfake").unwrap();
    path
}

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Write an executable shell script standing in for the Python interpreter.
///
/// It is called as `<script> -m latex_ocr_server <command> ...`, so the
/// command is `$3`.
#[cfg(unix)]
pub fn fake_python(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("python3");
    std::fs::write(&path, format!("#!/bin/sh\n[ \"$1\" = \"--exec-check\" ] && exit 0\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    // Another test thread may fork while the file is open for writing
    for _ in 0..50 {
        match std::process::Command::new(&path).arg("--exec-check").output() {
            Err(e) if e.raw_os_error() == Some(26) => {
                std::thread::sleep(std::time::Duration::from_millis(20))
            }
            _ => break,
        }
    }
    path
}
