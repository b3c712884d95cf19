use codedropx_common::{
    ChannelMessage, ControlMessage, DirectChannel, ReceivedFile, TransferEvent,
    loopback::channel_pair,
};
use codedropx_receiver::Reassembler;
use rstest::rstest;

/// Create test data of specified size
fn create_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

/// Frames for one file the way the sending side emits them.
fn file_frames(index: usize, name: &str, data: &[u8], chunk_size: usize) -> Vec<ChannelMessage> {
    let id = format!("file_{index}");
    let mut frames = vec![
        ControlMessage::FileStart {
            id: id.clone(),
            name: name.to_string(),
            byte_size: data.len() as u64,
            mime_type: "application/octet-stream".to_string(),
            index,
        }
        .encode()
        .unwrap(),
    ];
    frames.extend(
        data.chunks(chunk_size)
            .map(|chunk| ChannelMessage::Binary(chunk.to_vec())),
    );
    frames.push(ControlMessage::FileComplete { id, index }.encode().unwrap());
    frames
}

/// Chunk boundaries never show in the reassembled bytes, and progress
/// climbs monotonically to exactly 100.
#[rstest]
#[case::tiny_chunks(100)]
#[case::uneven_chunks(4_000)]
#[case::single_chunk(64 * 1024)]
#[tokio::test]
async fn test_large_file_over_loopback(#[case] chunk_size: usize) {
    let data = create_test_data(50_000);
    let (sender, receiver) = channel_pair();

    for frame in file_frames(0, "big.bin", &data, chunk_size) {
        sender.send(frame).await.unwrap();
    }
    sender
        .send(ControlMessage::TransferComplete.encode().unwrap())
        .await
        .unwrap();

    let mut reassembler = Reassembler::new();
    let mut percents = Vec::new();
    let mut files: Vec<ReceivedFile> = Vec::new();
    while !reassembler.is_finished() {
        let message = receiver.recv().await.expect("channel ended early");
        for event in reassembler.handle(message).unwrap() {
            match event {
                TransferEvent::Progress { percent, .. } => percents.push(percent),
                TransferEvent::FileReceived(file) => files.push(file),
                _ => {}
            }
        }
    }

    assert_eq!(files.len(), 1);
    assert_eq!(files[0].data, data);
    assert_eq!(files[0].byte_size, 50_000);
    assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(percents.last(), Some(&100));
    assert_eq!(receiver.buffered_amount(), 0);
    assert_eq!(sender.buffered_amount(), 0);
}

/// Files of a batch come out in the order they went in, empty ones included.
#[tokio::test]
async fn test_batch_order_is_preserved() {
    let batch = [
        ("first.txt", create_test_data(3_000)),
        ("empty.txt", Vec::new()),
        ("third.txt", create_test_data(17)),
    ];
    let (sender, receiver) = channel_pair();
    for (index, (name, data)) in batch.iter().enumerate() {
        for frame in file_frames(index, name, data, 1024) {
            sender.send(frame).await.unwrap();
        }
    }
    sender
        .send(ControlMessage::TransferComplete.encode().unwrap())
        .await
        .unwrap();
    sender.close().await;

    let mut reassembler = Reassembler::new();
    let mut files = Vec::new();
    while let Some(message) = receiver.recv().await {
        for event in reassembler.handle(message).unwrap() {
            if let TransferEvent::FileReceived(file) = event {
                files.push(file);
            }
        }
    }

    assert!(reassembler.is_finished());
    assert_eq!(reassembler.completed_files(), 3);
    let names: Vec<&str> = files.iter().map(|file| file.name.as_str()).collect();
    assert_eq!(names, ["first.txt", "empty.txt", "third.txt"]);
    for (file, (_, data)) in files.iter().zip(batch.iter()) {
        assert_eq!(&file.data, data);
    }
}
