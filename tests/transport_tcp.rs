use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use teleop_follower::frame::Frame;
use teleop_follower::ingest::{
    encode_jpeg, write_frame_message, IngestStats, TcpFrameSubscriber, MAX_FRAME_BYTES,
};
use teleop_follower::transport::{
    CommandPublisher, CommandRecord, FrameChannel, Receive, TcpCommandPublisher,
};

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn jpeg_frames_arrive_in_the_mailbox() {
    let channel = FrameChannel::new();
    let mut subscriber =
        TcpFrameSubscriber::bind("127.0.0.1:0", channel.clone()).expect("bind video port");

    let mut publisher = TcpStream::connect(subscriber.local_addr()).expect("connect");
    let jpeg = encode_jpeg(&Frame::solid(64, 48, [255, 0, 0])).expect("encode");
    write_frame_message(&mut publisher, &jpeg).expect("send frame");

    match channel.try_receive(Duration::from_secs(5)) {
        Receive::Fresh(frame) => {
            assert_eq!((frame.width(), frame.height()), (64, 48));
            assert_eq!(frame.seq(), 0);
        }
        Receive::Timeout => panic!("frame did not arrive"),
    }

    write_frame_message(&mut publisher, b"not an image").expect("send garbage");
    assert!(wait_until(|| subscriber.stats().decode_errors == 1));
    // the connection survives a bad frame
    write_frame_message(&mut publisher, &jpeg).expect("send frame");
    assert!(matches!(
        channel.try_receive(Duration::from_secs(5)),
        Receive::Fresh(_)
    ));

    let stats = subscriber.stats();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.received, 3);
    subscriber.stop();
}

#[test]
fn oversize_and_corrupt_messages_are_skipped() {
    let channel = FrameChannel::new();
    let mut subscriber =
        TcpFrameSubscriber::bind("127.0.0.1:0", channel.clone()).expect("bind video port");
    let mut publisher = TcpStream::connect(subscriber.local_addr()).expect("connect");

    let oversize = MAX_FRAME_BYTES + 1;
    publisher
        .write_all(&(oversize as u32).to_be_bytes())
        .expect("send oversize header");
    publisher
        .write_all(&vec![0u8; oversize])
        .expect("send oversize body");
    write_frame_message(&mut publisher, b"\xff\xd8 truncated jpeg").expect("send corrupt frame");
    let jpeg = encode_jpeg(&Frame::solid(32, 24, [0, 255, 0])).expect("encode");
    write_frame_message(&mut publisher, &jpeg).expect("send frame");

    match channel.try_receive(Duration::from_secs(10)) {
        Receive::Fresh(frame) => {
            assert_eq!((frame.width(), frame.height()), (32, 24));
            assert_eq!(frame.seq(), 1);
        }
        Receive::Timeout => panic!("valid frame after skipped messages did not arrive"),
    }
    assert_eq!(
        subscriber.stats(),
        IngestStats {
            connections: 1,
            received: 2,
            decode_errors: 1,
            oversize: 1,
        }
    );
    subscriber.stop();
}

#[test]
fn unread_frames_are_conflated() {
    let channel = FrameChannel::new();
    let subscriber =
        TcpFrameSubscriber::bind("127.0.0.1:0", channel.clone()).expect("bind video port");
    let mut publisher = TcpStream::connect(subscriber.local_addr()).expect("connect");
    let jpeg = encode_jpeg(&Frame::solid(16, 16, [0, 0, 255])).expect("encode");
    for _ in 0..4 {
        write_frame_message(&mut publisher, &jpeg).expect("send frame");
    }
    assert!(wait_until(|| channel.stats().posted == 4));

    match channel.try_receive(Duration::from_secs(1)) {
        Receive::Fresh(frame) => assert_eq!(frame.seq(), 3),
        Receive::Timeout => panic!("frame did not arrive"),
    }
    assert!(!channel.has_pending());
    assert_eq!(channel.stats().conflated, 3);
}

#[test]
fn command_subscribers_receive_json_lines() {
    let mut publisher = TcpCommandPublisher::bind("127.0.0.1:0").expect("bind command port");
    let client = TcpStream::connect(publisher.local_addr()).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    assert!(wait_until(|| publisher.subscriber_count() == 1));

    let record = CommandRecord {
        linear: 0.12,
        angular: -0.08,
        status: "TRACK 'person' (0.91)".into(),
        ts: 1_700_000_000.25,
    };
    publisher.publish(&record).expect("publish");

    let mut line = String::new();
    BufReader::new(client).read_line(&mut line).expect("read line");
    assert!(line.ends_with('\n'));
    let received: CommandRecord = serde_json::from_str(line.trim_end()).expect("parse");
    assert_eq!(received, record);
}

#[test]
fn publishing_without_subscribers_is_not_an_error() {
    let mut publisher = TcpCommandPublisher::bind("127.0.0.1:0").expect("bind command port");
    let record = CommandRecord {
        linear: 0.0,
        angular: 0.0,
        status: "SEARCH".into(),
        ts: 0.0,
    };
    publisher.publish(&record).expect("publish");
    assert_eq!(publisher.subscriber_count(), 0);
}
