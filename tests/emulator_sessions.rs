//! Emulator wire-protocol sessions: auto-detect, lock-on, round-trips.

use tactboard::emulators::{self, chessnut, millennium, pegasus, Emulator, EmulatorKind};
use tactboard::engine::position::{LiveGame, INITIAL_FEN};
use tactboard::store::Store;
use tactboard::types::GameMove;

fn store_with(fen: &str) -> Store {
    let store = Store::new();
    store.game.mutate(|g| g.fen = fen.to_string());
    store
}

/// Positions with captures, castled kings and promoted pieces.
fn representative_fens() -> Vec<String> {
    let mut game = LiveGame::new();
    let mut fens = vec![INITIAL_FEN.to_string()];
    for uci in [
        "e2e4", "e7e5", "g1f3", "b8c6", "f1c4", "g8f6", "e1g1", "f6e4", "f1e1", "e4f6",
    ] {
        game.play(GameMove::from_uci(uci).unwrap()).unwrap();
        fens.push(game.fen());
    }
    fens.push("4k3/P7/8/8/8/8/7p/4K3 w - - 0 1".to_string());
    fens
}

#[test]
fn millennium_board_state_round_trips() {
    for fen in representative_fens() {
        let store = store_with(&fen);
        let mut emulator = millennium::Millennium::new(store);
        let handled = emulator.accept(&millennium::encode_command("S")).unwrap();
        let chars = millennium::decode_board_state(&handled.reply).unwrap();

        // re-derive the 64 chars from the FEN and compare rank by rank
        let expected = emulators::fen_board_chars(&fen);
        for (i, c) in chars.chars().enumerate() {
            let rank = 7 - i / 8;
            let file = i % 8;
            assert_eq!(
                c,
                expected[rank * 8 + file],
                "square ({file},{rank}) differs for {fen}"
            );
        }
    }
}

#[test]
fn chessnut_nibble_packing_round_trips() {
    for fen in representative_fens() {
        let chars = emulators::fen_board_chars(&fen);
        let packed = chessnut::pack_board(&chars);
        assert_eq!(chessnut::unpack_board(&packed), chars, "fen {fen}");
    }
}

#[test]
fn pegasus_board_dump_round_trips() {
    for fen in representative_fens() {
        let store = store_with(&fen);
        let mut emulator = pegasus::Pegasus::new(store);
        let handled = emulator.accept(&[pegasus::DGT_SEND_BRD]).unwrap();
        let (id, payload) = pegasus::unframe_message(&handled.reply).unwrap();
        assert_eq!(id, pegasus::MSG_BOARD_DUMP);
        assert_eq!(payload.len(), 64);

        let expected = emulators::fen_board_chars(&fen);
        let occupied = expected.iter().filter(|c| **c != '.').count();
        let nonzero = payload.iter().filter(|b| **b != 0).count();
        assert_eq!(occupied, nonzero, "piece count differs for {fen}");
    }
}

#[test]
fn auto_detect_locks_the_first_accepting_parser() {
    let store = Store::new();

    // the ChessLink version query with its parity byte locks Millennium
    let v = millennium::encode_command("V");
    assert_eq!(v[0], 0xD6);
    let (kind, mut emulator) = emulators::detect(&v, &store).unwrap();
    assert_eq!(kind, EmulatorKind::Millennium);

    // the replayed first frame produces the v reply
    let handled = emulator.accept(&v).unwrap();
    assert!(!handled.reply.is_empty());

    // subsequent Pegasus-looking bytes are rejected by the locked emulator
    assert!(emulator.accept(&[pegasus::DGT_SEND_BRD]).is_err());
}

#[test]
fn detect_order_is_millennium_pegasus_chessnut() {
    let store = Store::new();
    let (kind, _) = emulators::detect(&[pegasus::DGT_SEND_RESET], &store).unwrap();
    assert_eq!(kind, EmulatorKind::Pegasus);
    let (kind, _) = emulators::detect(&[chessnut::CMD_REALTIME, 0x01, 0x00], &store).unwrap();
    assert_eq!(kind, EmulatorKind::Chessnut);
    assert!(emulators::detect(&[0xF0, 0x0F], &store).is_none());
}
