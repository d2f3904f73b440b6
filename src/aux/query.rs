use std::io::{BufRead, BufReader};
use std::process::ChildStdout;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use cozy_chess::Board;
use cozy_chess::Move;
use log::{debug, warn};

use crate::board::position::{apply_checked, pack_move, parse_uci_move};
use crate::tree::{self, AuxState, Node};

use super::queues::{pv_cache_key, PvRecord, MAX_PV_LEN, MIN_PV_LEN, PV_QUEUE_CAP};
use super::worker::Shared;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum QueryOutcome {
    Completed,
    Stopped,
    Stale,
    EmptyPv,
}

// The tag is queue state that happens to live on the node; keep every
// write under the node-queue lock.
fn set_tag(shared: &Shared, node: &Node, state: AuxState) {
    let _q = shared.queue.lock().unwrap();
    node.set_aux_state(state);
}

struct StreamEnd {
    stopping: bool,
    prev_line: String,
}

/// Drive one helper query for `target`: frame the position, stream the
/// helper's output, cancel on stop, and feed PVs to the encoder. In
/// infinite mode every info line is encoded as it arrives; otherwise only
/// the final line before `bestmove` is used.
pub(crate) fn run_query(
    shared: &Shared,
    index: usize,
    target: &Arc<Node>,
    infinite: bool,
) -> Result<QueryOutcome> {
    if shared.stop.load(Ordering::Acquire) {
        set_tag(shared, target, AuxState::Unset);
        return Ok(QueryOutcome::Stopped);
    }

    let (root, base_board) = {
        let guard = shared.search.read().unwrap();
        let ctx = guard.as_ref().context("no active search")?;
        (ctx.root.clone(), ctx.history.last().board().clone())
    };

    // Walk up to root to recover the move line, then replay it onto the
    // game's current position.
    let Some(prefix) = tree::moves_from_root(target, &root) else {
        set_tag(shared, target, AuxState::Unset);
        return Ok(QueryOutcome::Stale);
    };
    let start_depth = prefix.len() as u32;
    let mut board = base_board;
    for &mv in &prefix {
        if !apply_checked(&mut board, mv) {
            warn!("helper {}: queued node unreachable from root, dropping", index);
            set_tag(shared, target, AuxState::Unset);
            return Ok(QueryOutcome::Stale);
        }
    }

    let movetime_ms = {
        let q = shared.queue.lock().unwrap();
        if shared.stop.load(Ordering::Acquire) || q.final_purge_run {
            target.set_aux_state(AuxState::Unset);
            return Ok(QueryOutcome::Stale);
        }
        q.movetime_ms
    };

    let position_cmd = format!("position fen {}", board);
    let go_cmd =
        if infinite { "go infinite".to_string() } else { format!("go movetime {}", movetime_ms) };
    if !shared.pool.begin_query(index, &position_cmd, &go_cmd, &shared.stop)? {
        set_tag(shared, target, AuxState::Unset);
        return Ok(QueryOutcome::Stopped);
    }
    if shared.opts.verbosity >= 9 {
        debug!("helper {}: {} / {} (depth {})", index, position_cmd, go_cmd, start_depth);
    }
    let started = Instant::now();

    let mut reader = shared.pool.take_reader(index).context("helper reader missing")?;
    let streamed = stream_query(shared, index, &mut reader, infinite, start_depth, &board, &prefix);
    shared.pool.put_reader(index, reader);
    let end = streamed?;

    if end.stopping {
        // Output of a cancelled query is discarded outright.
        set_tag(shared, target, AuxState::Unset);
        return Ok(QueryOutcome::Stopped);
    }
    shared.pool.mark_idle(index);

    if end.prev_line.is_empty() {
        if shared.opts.verbosity >= 1 {
            debug!("helper {}: empty PV after query, backing off", index);
        }
        set_tag(shared, target, AuxState::Unset);
        std::thread::sleep(Duration::from_millis(100));
        return Ok(QueryOutcome::EmptyPv);
    }
    if !shared.pool.is_running(index)? {
        bail!("helper {} died", index);
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    {
        let mut q = shared.queue.lock().unwrap();
        q.helper_evals += 1;
        q.total_eval_ms += elapsed_ms;
    }

    encode_and_enqueue(shared, &end.prev_line, start_depth, board, &prefix, false, index);
    set_tag(shared, target, AuxState::Done);
    Ok(QueryOutcome::Completed)
}

fn stream_query(
    shared: &Shared,
    index: usize,
    reader: &mut BufReader<ChildStdout>,
    infinite: bool,
    start_depth: u32,
    board: &Board,
    prefix: &[Move],
) -> Result<StreamEnd> {
    let mut line = String::new();
    let mut prev_line = String::new();
    let mut stopping = false;
    loop {
        line.clear();
        let n = reader.read_line(&mut line).context("reading helper output")?;
        if n == 0 {
            bail!("helper {} closed its output stream", index);
        }
        let trimmed = line.trim_end();
        if shared.opts.verbosity >= 10 {
            debug!("helper {} says: {}", index, trimmed);
        }
        let mut toks = trimmed.split_whitespace();
        let first = toks.next();

        if first == Some("bestmove") {
            if toks.next() == Some("info") {
                // Corrupted interleaving in the helper's output; resync
                // with a stop and keep draining.
                warn!("helper {} emitted 'bestmove info', resyncing", index);
                shared.pool.send_stop_raw(index)?;
                continue;
            }
            return Ok(StreamEnd { stopping, prev_line });
        }
        prev_line.clear();
        prev_line.push_str(trimmed);

        if !stopping {
            stopping = shared.stop.load(Ordering::Acquire);
            if stopping {
                // First to notice the cancellation sends the one stop;
                // then keep draining until bestmove.
                shared.pool.send_stop_once(index)?;
            } else if infinite && first == Some("info") {
                encode_and_enqueue(shared, trimmed, start_depth, board.clone(), prefix, true, index);
            }
        }
    }
}

/// Turn one `info ... pv ...` line into a grafting-queue record: gate on
/// depth/node support, parse and validate each move against an advancing
/// board, truncate, dedup through the PV cache, and enqueue.
pub(crate) fn encode_and_enqueue(
    shared: &Shared,
    line: &str,
    start_depth: u32,
    mut board: Board,
    prefix: &[Move],
    require_depth: bool,
    index: usize,
) {
    if shared.stop.load(Ordering::Acquire) {
        return;
    }

    let mut depth_reached: usize = 0;
    let mut support: u64 = 0;
    let mut packed: Vec<u16> = Vec::new();
    let mut pv_moves: Vec<Move> = Vec::new();

    let mut toks = line.split_whitespace();
    while let Some(tok) = toks.next() {
        match tok {
            "info" => continue,
            "string" => return,
            "depth" => {
                if let Some(v) = toks.next().and_then(|s| s.parse().ok()) {
                    depth_reached = v;
                }
            }
            "nodes" => {
                if let Some(v) = toks.next().and_then(|s| s.parse().ok()) {
                    support = v;
                }
            }
            "pv" => {
                // Accept unconditionally for final PVs; streamed PVs need
                // either real node support or real depth behind them.
                if require_depth && support < 1000 && depth_reached <= 10 {
                    return;
                }
                let cap = depth_reached.min(MAX_PV_LEN);
                for mv_tok in toks.by_ref() {
                    if pv_moves.len() >= cap {
                        break;
                    }
                    let Some(mv) = parse_uci_move(&board, mv_tok) else {
                        if shared.opts.verbosity >= 1 {
                            warn!("helper {}: ignoring bad pv move {}", index, mv_tok);
                        }
                        break;
                    };
                    packed.push(pack_move(mv));
                    pv_moves.push(mv);
                    board.play(mv);
                }
                break;
            }
            _ => {}
        }
    }

    if pv_moves.len() < MIN_PV_LEN {
        if shared.opts.verbosity >= 9 {
            debug!("helper {}: PV of length {} below minimum, dropped", index, pv_moves.len());
        }
        return;
    }

    let key = pv_cache_key(&packed);
    if shared.cache.seen_or_insert(&key) {
        if shared.opts.verbosity >= 9 {
            debug!("helper {}: duplicate PV dropped", index);
        }
        return;
    }

    let mut moves = prefix.to_vec();
    moves.extend(pv_moves);
    let record = PvRecord { moves, start_depth, support };

    let mut pvs = shared.pvs.lock().unwrap();
    if pvs.len() < PV_QUEUE_CAP {
        pvs.push_back(record);
    } else if shared.opts.verbosity >= 3 {
        debug!(
            "helper {}: grafting queue full, dropped PV at depth {} with {} nodes",
            index, start_depth, support
        );
    }
}
