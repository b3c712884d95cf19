use std::io;

use codedrop_entities::File;
use codedropx_common::{
    ChannelMessage, ControlMessage, DirectChannel, Subscribers, TransferError, TransferEvent,
    progress_percent,
};
use tracing::{debug, info};

use crate::SenderConfig;

/// Sends every file in order, then one `transfer-complete`.
pub(crate) async fn send_batch(
    channel: &dyn DirectChannel,
    files: &[File],
    config: &SenderConfig,
    subscribers: &Subscribers,
) -> Result<(), TransferError> {
    info!("Sending {} files", files.len());
    for (index, file) in files.iter().enumerate() {
        send_file(channel, file, index, config, subscribers).await?;
    }
    channel.send(ControlMessage::TransferComplete.encode()?).await?;
    info!("All files sent");
    Ok(())
}

async fn send_file(
    channel: &dyn DirectChannel,
    file: &File,
    index: usize,
    config: &SenderConfig,
    subscribers: &Subscribers,
) -> Result<(), TransferError> {
    let total = file.len();
    debug!("Sending file {} ({} bytes)", file.name, total);

    let start = ControlMessage::FileStart {
        id: file.id.clone(),
        name: file.name.clone(),
        byte_size: total,
        mime_type: file.mime_type.clone(),
        index,
    };
    channel.send(start.encode()?).await?;

    if total == 0 {
        notify_progress(subscribers, file, 100);
    }

    let mut offset = 0u64;
    while offset < total {
        wait_for_backlog(channel, config).await?;

        let want = config.chunk_size.min(total - offset);
        let chunk = file.data.read_chunk(want)?;
        if chunk.is_empty() {
            return Err(TransferError::ReadError(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} ended at {} of {} bytes", file.name, offset, total),
            )));
        }
        offset += chunk.len() as u64;
        channel.send(ChannelMessage::Binary(chunk)).await?;
        notify_progress(subscribers, file, progress_percent(offset, total));
    }

    let complete = ControlMessage::FileComplete {
        id: file.id.clone(),
        index,
    };
    channel.send(complete.encode()?).await?;
    debug!("File {} sent completely", file.name);
    Ok(())
}

/// Yields while the channel holds more than the high-water mark.
async fn wait_for_backlog(
    channel: &dyn DirectChannel,
    config: &SenderConfig,
) -> Result<(), TransferError> {
    while channel.buffered_amount() > config.high_water_mark {
        if !channel.is_open() {
            return Err(TransferError::ChannelClosed);
        }
        tokio::time::sleep(config.backlog_poll_interval).await;
    }
    Ok(())
}

fn notify_progress(subscribers: &Subscribers, file: &File, percent: u8) {
    subscribers.notify(TransferEvent::Progress {
        id: file.id.clone(),
        name: file.name.clone(),
        percent,
    });
}
