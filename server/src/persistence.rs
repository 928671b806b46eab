use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{error, info, warn};
use tracker_relay_protocol::header;
use tracker_relay_protocol::messages::tracking_to_server;
use tracker_relay_protocol::tlv;

use crate::metrics;
use crate::registry::{self, Registry};

const FILE_PREFIX: &str = "tracking-";

/// Producer-side handle to the persistence writer task. Cheap to clone;
/// every session hands one accepted Tracking frame at a time to
/// [`PersistenceHandle::enqueue`].
#[derive(Clone)]
pub struct PersistenceHandle {
    sender: UnboundedSender<Vec<u8>>,
}

impl PersistenceHandle {
    /// Enqueues `frame` (the full on-the-wire Tracking message, header
    /// included) for durable append. Never blocks: the channel is FIFO,
    /// and a message counts as retained for as long as it sits in the
    /// channel rather than having been handed to the writer.
    pub fn enqueue(&self, frame: Vec<u8>) {
        if self.sender.send(frame).is_err() {
            error!("persistence writer task is gone, dropping a tracking message");
        }
        metrics::persistence_queue_depth(self.sender.len());
    }
}

/// Spawns the single writer task and returns the handle producers enqueue
/// through. The task owns the currently open `tracking-YYYY-MM-DD` file,
/// reopening it whenever the UTC date rolls over, and is the only writer of
/// that file.
pub fn spawn_writer(storage_dir: PathBuf) -> PersistenceHandle {
    let (sender, mut receiver) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        let mut current_date = String::new();
        let mut file: Option<File> = None;

        while let Some(frame) = receiver.recv().await {
            let date = Utc::now().format("%Y-%m-%d").to_string();
            if date != current_date || file.is_none() {
                match open_for_append(&storage_dir, &date).await {
                    Ok(f) => {
                        current_date = date;
                        file = Some(f);
                    }
                    Err(err) => {
                        error!(%err, "failed to open persistence file, dropping tracking message");
                        continue;
                    }
                }
            }

            if let Some(f) = file.as_mut() {
                if let Err(err) = f.write_all(&frame).await {
                    error!(%err, "failed to append tracking message");
                }
            }

            if receiver.is_empty() {
                if let Some(f) = file.as_mut() {
                    if let Err(err) = f.sync_data().await {
                        error!(%err, "failed to flush persistence file");
                    }
                }
            }
        }
    });

    PersistenceHandle { sender }
}

async fn open_for_append(storage_dir: &Path, date: &str) -> io::Result<File> {
    let path = storage_dir.join(format!("{FILE_PREFIX}{date}"));
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Startup recovery: registers every marker-file device, then replays every
/// `tracking*` file's messages through the fusion path in last-modified
/// order, without re-enqueuing them to the writer (they are already
/// durable).
pub async fn scan_storage_dir(storage_dir: &Path, registry: &Registry) -> io::Result<()> {
    registry::scan_marker_files(storage_dir, registry).await?;

    let mut candidates = Vec::new();
    let mut read_dir = fs::read_dir(storage_dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.starts_with(FILE_PREFIX) {
            let modified = entry.metadata().await?.modified()?;
            candidates.push((modified, entry.path()));
        }
    }
    candidates.sort_by_key(|(modified, _)| *modified);

    for (_, path) in candidates {
        if let Err(err) = replay_file(&path, registry).await {
            warn!(path = %path.display(), %err, "failed to replay persisted tracking file");
        }
    }

    Ok(())
}

async fn replay_file(path: &Path, registry: &Registry) -> io::Result<()> {
    let bytes = fs::read(path).await?;
    let mut offset = 0usize;
    let mut replayed = 0usize;

    while offset < bytes.len() {
        let remaining = &bytes[offset..];
        let parsed_header = match header::read_header(remaining) {
            Ok(h) => h,
            Err(err) => {
                warn!(path = %path.display(), %err, "stopping replay at malformed header");
                break;
            }
        };
        let frame_len = parsed_header.size as usize;
        if frame_len > remaining.len() {
            warn!(path = %path.display(), "truncated final frame during replay");
            break;
        }
        let frame = &remaining[..frame_len];
        replay_frame(frame, registry);
        replayed += 1;
        offset += frame_len;
    }

    info!(path = %path.display(), replayed, "replayed persisted tracking file");
    Ok(())
}

fn replay_frame(frame: &[u8], registry: &Registry) {
    let device_id = match tracking_to_server::get_device_id(frame) {
        Ok(id) => id,
        Err(err) => {
            warn!(%err, "skipping malformed tracking frame during replay");
            return;
        }
    };
    let sequence = match tracking_to_server::get_sequence(frame) {
        Ok(seq) => seq,
        Err(err) => {
            warn!(%err, "skipping malformed tracking frame during replay");
            return;
        }
    };
    let tlv_body = match tracking_to_server::get_tlv_body(frame) {
        Ok(body) => body,
        Err(err) => {
            warn!(%err, "skipping malformed tracking frame during replay");
            return;
        }
    };

    let device = registry.insert_if_absent(device_id);
    device.record_sequence(sequence);
    let outcome = tlv::parse_tlvs(tlv_body);
    if let Some(err) = &outcome.error {
        warn!(%err, device = %device_id, "broken field while replaying persisted tracking file");
    }
    device.apply_tracking(&outcome.fields);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracker_relay_protocol::messages::tracking_to_server;
    use tracker_relay_protocol::{DeviceId, TlvFieldOwned};

    #[tokio::test]
    async fn scan_storage_dir_registers_and_replays() {
        let dir = tempfile::tempdir().unwrap();
        let id = DeviceId::new_random();
        registry::create_marker_file(dir.path(), id).await.unwrap();

        let fields = vec![TlvFieldOwned::BatteryLevel { time: 100, level: 42 }];
        let mut buf = vec![0u8; tracking_to_server::size(&fields)];
        tracking_to_server::encode(&mut buf, id, 1, &fields);
        fs::write(dir.path().join("tracking-2024-01-01"), &buf)
            .await
            .unwrap();

        let registry = Registry::new();
        scan_storage_dir(dir.path(), &registry).await.unwrap();

        assert!(registry.contains(id));
        let device = registry.get(id).unwrap();
        let snapshot = device.snapshot_fields();
        assert_eq!(snapshot.battery, Some((100, 42)));
    }

    #[tokio::test]
    async fn writer_appends_frames_to_a_dated_file() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_writer(dir.path().to_path_buf());

        let fields = vec![TlvFieldOwned::BatteryLevel { time: 1, level: 10 }];
        let id = DeviceId::new_random();
        let mut buf = vec![0u8; tracking_to_server::size(&fields)];
        tracking_to_server::encode(&mut buf, id, 1, &fields);
        handle.enqueue(buf.clone());

        // give the writer task a chance to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let date = Utc::now().format("%Y-%m-%d").to_string();
        let path = dir.path().join(format!("{FILE_PREFIX}{date}"));
        let written = fs::read(path).await.unwrap();
        assert_eq!(written, buf);
    }
}
