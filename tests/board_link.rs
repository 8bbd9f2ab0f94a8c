//! Link + board abstraction over an in-memory serial pair.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use tactboard::board::{from_hw, to_hw, BoardService, INACTIVITY_TIMEOUT, INACTIVITY_WARNING};
use tactboard::link::frame::{Frame, FrameType};
use tactboard::link::{Link, EVENT_CHANNEL_CAPACITY};
use tactboard::types::{Key, Square};

fn sq(name: &str) -> Square {
    let b = name.as_bytes();
    Square::from_coords(b[0] - b'a', b[1] - b'1')
}

/// Fake micro-controller: acks requests, answers a scripted board state,
/// lets the test push event frames.
async fn fake_mcu(
    mut port: tokio::io::DuplexStream,
    state: Arc<Mutex<[u8; 8]>>,
    mut inject: mpsc::UnboundedReceiver<Frame>,
) {
    let mut buf = bytes::BytesMut::new();
    loop {
        tokio::select! {
            read = port.read_buf(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                while let Ok(Some((frame, used))) = Frame::parse(&buf) {
                    let _ = buf.split_to(used);
                    let reply = match frame.frame_type {
                        FrameType::Init => Frame::new(FrameType::Ack, Vec::new()),
                        FrameType::StateRequest => {
                            Frame::new(FrameType::State, state.lock().to_vec())
                        }
                        FrameType::Poll => Frame::new(FrameType::Idle, Vec::new()),
                        _ => Frame::new(FrameType::Ack, Vec::new()),
                    };
                    if port.write_all(&reply.encode()).await.is_err() {
                        return;
                    }
                }
            }
            frame = inject.recv() => {
                let Some(frame) = frame else { return };
                if port.write_all(&frame.encode()).await.is_err() {
                    return;
                }
            }
        }
    }
}

struct Bench {
    board: tactboard::board::Board,
    _service: BoardService,
    mcu_state: Arc<Mutex<[u8; 8]>>,
    inject: mpsc::UnboundedSender<Frame>,
}

async fn bench() -> Bench {
    let (ours, theirs) = tokio::io::duplex(4096);
    let mcu_state = Arc::new(Mutex::new([0u8; 8]));
    let (inject, inject_rx) = mpsc::unbounded_channel();
    tokio::spawn(fake_mcu(theirs, mcu_state.clone(), inject_rx));

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let link = Link::open(ours, tx);
    link.init().await.unwrap();
    let service = BoardService::start(link, rx, INACTIVITY_TIMEOUT, INACTIVITY_WARNING);
    Bench {
        board: service.board.clone(),
        _service: service,
        mcu_state,
        inject,
    }
}

#[tokio::test]
async fn sensor_layout_is_translated_to_chess_squares() {
    let bench = bench().await;

    // the MCU reports two occupied sensors; the board must report the
    // corresponding chess squares
    {
        let mut state = bench.mcu_state.lock();
        for target in [sq("e2"), sq("a8")] {
            let hw = to_hw(target);
            state[(hw / 8) as usize] |= 1 << (hw % 8);
        }
    }
    let presence = bench.board.read_board_state().await.unwrap();
    assert_eq!(presence.count(), 2);
    assert!(presence.contains(sq("e2")));
    assert!(presence.contains(sq("a8")));
}

#[tokio::test]
async fn lift_events_arrive_in_chess_coordinates_in_order() {
    let bench = bench().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        bench.board.subscribe_lift(move |square| seen.lock().push(square));
    }

    for target in ["e2", "d7", "h1"] {
        bench
            .inject
            .send(Frame::new(FrameType::Lift, vec![to_hw(sq(target))]))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.lock().as_slice(), &[sq("e2"), sq("d7"), sq("h1")]);
}

#[tokio::test]
async fn keys_and_battery_fan_out_to_their_handlers() {
    let bench = bench().await;
    let keys = Arc::new(Mutex::new(Vec::new()));
    let battery = Arc::new(Mutex::new(None));
    {
        let keys = keys.clone();
        bench.board.subscribe_keys(move |key| keys.lock().push(key));
        let battery = battery.clone();
        bench
            .board
            .subscribe_battery(move |p, c| *battery.lock() = Some((p, c)));
    }

    bench
        .inject
        .send(Frame::new(FrameType::Key, vec![1]))
        .unwrap();
    bench
        .inject
        .send(Frame::new(FrameType::Battery, vec![88, 1]))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(keys.lock().as_slice(), &[Key::Up]);
    assert_eq!(*battery.lock(), Some((88, true)));
}

#[test]
fn hardware_transform_is_self_inverse_over_all_squares() {
    for square in Square::all() {
        assert_eq!(from_hw(to_hw(square)), square);
    }
}
