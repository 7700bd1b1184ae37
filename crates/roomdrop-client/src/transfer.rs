//! Chunked file transfer over a direct channel
//!
//! One channel carries exactly one transfer. The sender streams
//! `metadata`, then `chunk-metadata` + binary pairs under byte-level flow
//! control, then `complete`. The receiver is strictly frame-ordered: a
//! descriptor must be immediately followed by its binary frame, and any
//! other interleaving is a protocol violation.

use crate::store::{storage_err, ChunkStore};
use bytes::Bytes;
use roomdrop_core::{
    chunk_progress, Channel, ChunkDescriptor, ControlFrame, Error, Frame, Message, Result,
    TransferDirection, TransferMetadata, TransferStatus,
};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Progress notification: the transfer's metadata plus percent complete
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub metadata: TransferMetadata,
    pub progress: f64,
}

/// Byte-level pacing for the send path
#[derive(Debug, Clone, Copy)]
pub struct FlowControl {
    /// Suspend sending while the channel buffers more than this
    pub high_water: usize,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            high_water: roomdrop_core::BUFFER_HIGH_WATER,
        }
    }
}

/// Stream a file over `channel`
///
/// The caller has already persisted `meta` with status `pending` and opened
/// the channel labeled with the transfer id. Progress fires after each chunk
/// is queued (delivery is assumed once the channel accepts it) and once more
/// at 100 when the channel has fully drained.
pub async fn send_file<Ch: Channel>(
    channel: Ch,
    store: Arc<Mutex<ChunkStore>>,
    mut meta: TransferMetadata,
    path: PathBuf,
    flow: FlowControl,
    on_progress: impl Fn(TransferEvent) + Send,
) -> Result<()> {
    tracing::info!(
        id = %meta.id,
        name = %meta.name,
        size = meta.size,
        chunks = meta.total_chunks,
        "sending file"
    );

    let frame = Frame::Control(ControlFrame::Metadata {
        metadata: meta.clone(),
    });
    channel.send(frame.encode()?).await?;

    let file = std::fs::File::open(&path)?;
    let mut reader = std::io::BufReader::new(file);

    for index in 0..meta.total_chunks {
        let mut buf = vec![0u8; meta.chunk_len(index)];
        reader.read_exact(&mut buf)?;

        let progress = chunk_progress(index, meta.total_chunks);
        let descriptor = Frame::Control(ControlFrame::ChunkMetadata {
            metadata: ChunkDescriptor {
                transfer_id: meta.id.clone(),
                index,
                progress,
            },
        });
        channel.send(descriptor.encode()?).await?;

        while channel.buffered_amount() > flow.high_water {
            channel.buffered_low().await?;
        }
        channel.send(Message::Binary(Bytes::from(buf))).await?;
        tracing::trace!(id = %meta.id, index, progress, "chunk queued");
        on_progress(TransferEvent {
            metadata: meta.clone(),
            progress,
        });
    }

    while channel.buffered_amount() > 0 {
        channel.drained().await?;
    }

    meta.status = TransferStatus::Completed;
    store
        .lock()
        .await
        .save_metadata(&meta)
        .map_err(storage_err)?;
    let complete = Frame::Control(ControlFrame::Complete {
        metadata: meta.clone(),
    });
    channel.send(complete.encode()?).await?;
    on_progress(TransferEvent {
        metadata: meta.clone(),
        progress: 100.0,
    });
    channel.close().await;
    tracing::info!(id = %meta.id, "send finished");
    Ok(())
}

/// Receive one transfer from `channel`, persisting chunks as they arrive
///
/// Returns once the `complete` frame has been processed, or once the channel
/// closes (leaving whatever was last persisted in place). Frame-ordering
/// violations close the channel and reject with a protocol error.
pub async fn receive_file<Ch: Channel>(
    channel: Ch,
    sid: &str,
    store: Arc<Mutex<ChunkStore>>,
    on_progress: impl Fn(TransferEvent) + Send,
) -> Result<()> {
    let result = receive_frames(&channel, sid, store, &on_progress).await;
    if result.is_err() {
        channel.close().await;
    }
    result
}

async fn receive_frames<Ch: Channel>(
    channel: &Ch,
    sid: &str,
    store: Arc<Mutex<ChunkStore>>,
    on_progress: &(impl Fn(TransferEvent) + Send),
) -> Result<()> {
    let mut current: Option<TransferMetadata> = None;
    let mut pending: Option<ChunkDescriptor> = None;

    while let Some(msg) = channel.recv().await? {
        match Frame::decode(msg)? {
            Frame::Control(ControlFrame::Metadata { mut metadata }) => {
                if pending.is_some() {
                    return Err(Error::Protocol(
                        "metadata frame while a chunk descriptor is pending".to_string(),
                    ));
                }
                metadata.sid = sid.to_string();
                metadata.status = TransferStatus::Transferring;
                metadata.direction = TransferDirection::Receiving;
                store
                    .lock()
                    .await
                    .save_metadata(&metadata)
                    .map_err(storage_err)?;
                tracing::info!(
                    id = %metadata.id,
                    name = %metadata.name,
                    chunks = metadata.total_chunks,
                    "receiving file"
                );
                current = Some(metadata);
            }
            Frame::Control(ControlFrame::ChunkMetadata {
                metadata: descriptor,
            }) => {
                if pending.is_some() {
                    return Err(Error::Protocol(
                        "chunk descriptor not followed by chunk data".to_string(),
                    ));
                }
                let Some(meta) = current.as_ref() else {
                    return Err(Error::Protocol(
                        "chunk descriptor before transfer metadata".to_string(),
                    ));
                };
                if descriptor.transfer_id != meta.id {
                    return Err(Error::Protocol(format!(
                        "chunk descriptor for foreign transfer {}",
                        descriptor.transfer_id
                    )));
                }
                on_progress(TransferEvent {
                    metadata: meta.clone(),
                    progress: descriptor.progress,
                });
                pending = Some(descriptor);
            }
            Frame::Chunk(bytes) => {
                let Some(descriptor) = pending.take() else {
                    return Err(Error::Protocol(
                        "chunk data without a preceding descriptor".to_string(),
                    ));
                };
                store
                    .lock()
                    .await
                    .save_chunk(&descriptor.transfer_id, descriptor.index, &bytes)
                    .map_err(storage_err)?;
                tracing::trace!(
                    id = %descriptor.transfer_id,
                    index = descriptor.index,
                    len = bytes.len(),
                    "chunk persisted"
                );
                if let Some(meta) = current.as_mut() {
                    meta.received_chunks += 1;
                }
            }
            Frame::Control(ControlFrame::Complete { mut metadata }) => {
                if pending.is_some() {
                    return Err(Error::Protocol(
                        "complete frame while a chunk descriptor is pending".to_string(),
                    ));
                }
                metadata.sid = sid.to_string();
                metadata.direction = TransferDirection::Receiving;
                metadata.status = TransferStatus::Completed;
                {
                    let store = store.lock().await;
                    metadata.received_chunks =
                        store.chunk_count(&metadata.id).map_err(storage_err)?;
                    store.save_metadata(&metadata).map_err(storage_err)?;
                }
                tracing::info!(id = %metadata.id, name = %metadata.name, "receive finished");
                on_progress(TransferEvent {
                    metadata,
                    progress: 100.0,
                });
                channel.close().await;
                return Ok(());
            }
        }
    }

    // Channel closed before `complete`; whatever was last persisted stands
    tracing::warn!(sid, "channel closed mid-transfer");
    Ok(())
}
