mod common;

use graftbot::board::{parse_uci_move, PositionHistory};
use graftbot::tree::{AuxState, Node};
use graftbot::{AuxOptions, Coordinator};

const PV_STUB: &str = r#"#!/bin/sh
in="$0.in"
while read line; do
  echo "$line" >> "$in"
  case "$line" in
    uci)
      echo "id name stub"
      echo "option name SyzygyPath type string default <empty>"
      echo "uciok"
      ;;
    go*)
      echo "info depth 20 nodes 5000 pv e2e4 e7e5 g1f3 b8c6"
      echo "bestmove e2e4"
      ;;
  esac
done
"#;

fn expanded_root() -> (std::sync::Arc<Node>, PositionHistory) {
    let history = PositionHistory::starting();
    let root = Node::new_root();
    let e4 = parse_uci_move(history.last().board(), "e2e4").unwrap();
    root.add_child(e4);
    (root, history)
}

#[test]
fn helper_pv_reaches_grafting_queue() {
    common::init_logging();
    let stub = common::write_stub("pv_stub.sh", PV_STUB);
    let mut opts = AuxOptions::default();
    opts.engine_file = stub.display().to_string();
    opts.instances = 1;
    opts.movetime_ms = 50;
    opts.options = "Threads=1;Hash=16".into();
    opts.syzygy_path = Some("/tmp/tb".into());
    let mut coord = Coordinator::new(opts);

    let (root, history) = expanded_root();
    coord.start(root.clone(), history);

    assert!(common::wait_for(|| coord.pv_queue_len() > 0), "helper PV never arrived");
    let pv = coord.pop_pv().expect("queued PV");
    assert_eq!(pv.start_depth, 0, "root query starts at depth 0");
    assert_eq!(pv.support, 5000);
    let ucis: Vec<String> = pv.moves.iter().map(|m| m.to_string()).collect();
    assert_eq!(ucis, ["e2e4", "e7e5", "g1f3", "b8c6"]);
    assert!(
        common::wait_for(|| root.aux_state() == AuxState::Done),
        "completed query must stamp the node done"
    );

    coord.signal_stop();
    coord.wait(None);

    // The wire log shows the whole conversation: configured options, the
    // handshake, the SyzygyPath answer, then the framed query.
    let log = std::fs::read_to_string(format!("{}.in", stub.display())).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines[0], "setoption name Threads value 1");
    assert_eq!(lines[1], "setoption name Hash value 16");
    assert_eq!(lines[2], "uci");
    assert_eq!(lines[3], "setoption name SyzygyPath value /tmp/tb");
    assert_eq!(
        lines[4],
        "position fen rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1"
    );
    assert_eq!(lines[5], "go movetime 50");

    coord.shutdown();
}

#[test]
fn helpers_survive_across_moves_and_cache_resets() {
    common::init_logging();
    let stub = common::write_stub("pv_stub.sh", PV_STUB);
    let mut opts = AuxOptions::default();
    opts.engine_file = stub.display().to_string();
    opts.instances = 1;
    opts.movetime_ms = 50;
    let mut coord = Coordinator::new(opts);

    for _ in 0..2 {
        let (root, history) = expanded_root();
        coord.start(root, history);
        assert!(common::wait_for(|| coord.pv_queue_len() > 0), "helper PV never arrived");
        coord.signal_stop();
        coord.wait(None);
    }
    coord.shutdown();

    // One handshake only: the subprocess persisted across both searches,
    // and the second identical PV passed the (cleared) cache.
    let log = std::fs::read_to_string(format!("{}.in", stub.display())).unwrap();
    let uci_count = log.lines().filter(|l| *l == "uci").count();
    assert_eq!(uci_count, 1, "helper must not be respawned between moves");
    let go_count = log.lines().filter(|l| l.starts_with("go ")).count();
    assert!(go_count >= 2, "expected one query per search, saw {}", go_count);
}
