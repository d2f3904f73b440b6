use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use log::{debug, trace};

use super::options::{parse_option_pairs, AuxOptions};

/// Stdin handles and per-slot stopped flags. One mutex serialises every
/// write to helper stdin together with the flag updates, so a `stop`
/// cannot race with command submission.
struct PoolIo {
    writers: Vec<Option<ChildStdin>>,
    /// "Not currently computing": true when idle or already told to stop.
    stopped: Vec<bool>,
}

/// Child process and its output stream; each slot is driven by exactly
/// one worker, identified by the slot index.
#[derive(Default)]
struct HelperSlot {
    child: Option<Child>,
    reader: Option<BufReader<ChildStdout>>,
    ready: bool,
}

/// Pool of helper subprocesses. Helpers survive across moves; they are
/// terminated only at engine shutdown by closing their stdin.
pub(crate) struct HelperPool {
    io: Mutex<PoolIo>,
    slots: Vec<Mutex<HelperSlot>>,
}

impl HelperPool {
    pub fn new(n: usize) -> Self {
        Self {
            io: Mutex::new(PoolIo { writers: (0..n).map(|_| None).collect(), stopped: vec![true; n] }),
            slots: (0..n).map(|_| Mutex::new(HelperSlot::default())).collect(),
        }
    }

    /// Spawn and handshake helper `idx` if it is not already running:
    /// `setoption` pairs from the configuration string, then `uci`, then
    /// scan replies until `uciok`, answering a SyzygyPath advertisement
    /// along the way. Idempotent across searches.
    pub fn start_helper(&self, idx: usize, opts: &AuxOptions) -> Result<()> {
        let mut slot = self.slots[idx].lock().unwrap();
        if slot.ready {
            return Ok(());
        }
        let mut child = Command::new(&opts.engine_file)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning helper {} ({})", idx, opts.engine_file))?;
        let stdin = child.stdin.take().context("helper stdin unavailable")?;
        let stdout = child.stdout.take().context("helper stdout unavailable")?;
        {
            let mut io = self.io.lock().unwrap();
            io.writers[idx] = Some(stdin);
            io.stopped[idx] = true;
        }
        let mut reader = BufReader::new(stdout);

        for (k, v) in parse_option_pairs(opts.options_for_slot(idx)) {
            self.write_line(idx, &format!("setoption name {} value {}", k, v))?;
        }
        self.write_line(idx, "uci")?;

        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).context("reading helper handshake")?;
            if n == 0 {
                bail!("helper {} closed its pipe during handshake", idx);
            }
            trace!("helper {} handshake: {}", idx, line.trim_end());
            let mut toks = line.split_whitespace();
            match toks.next() {
                Some("uciok") => break,
                Some("option") => {
                    if toks.next() == Some("name") && toks.next() == Some("SyzygyPath") {
                        if let Some(path) = &opts.syzygy_path {
                            self.write_line(idx, &format!("setoption name SyzygyPath value {}", path))?;
                        }
                    }
                }
                _ => {}
            }
        }
        slot.child = Some(child);
        slot.reader = Some(reader);
        slot.ready = true;
        debug!("helper {} ready", idx);
        Ok(())
    }

    pub fn write_line(&self, idx: usize, cmd: &str) -> Result<()> {
        let mut io = self.io.lock().unwrap();
        let w = io.writers[idx].as_mut().with_context(|| format!("helper {} not started", idx))?;
        writeln!(w, "{}", cmd)?;
        w.flush()?;
        Ok(())
    }

    /// Submit a query: position plus go, atomically with respect to stop.
    /// Returns false (writing nothing) when stop was raised first.
    pub fn begin_query(
        &self,
        idx: usize,
        position_cmd: &str,
        go_cmd: &str,
        stop: &AtomicBool,
    ) -> Result<bool> {
        let mut io = self.io.lock().unwrap();
        if stop.load(Ordering::Acquire) {
            return Ok(false);
        }
        let w = io.writers[idx].as_mut().with_context(|| format!("helper {} not started", idx))?;
        writeln!(w, "{}", position_cmd)?;
        writeln!(w, "{}", go_cmd)?;
        w.flush()?;
        io.stopped[idx] = false;
        Ok(true)
    }

    /// Send `stop` to a computing helper; the flag guard guarantees a
    /// helper sees at most one `stop` per query no matter how many
    /// threads race to cancel it. Returns whether the stop was sent.
    pub fn send_stop_once(&self, idx: usize) -> Result<bool> {
        let mut io = self.io.lock().unwrap();
        if io.stopped[idx] {
            return Ok(false);
        }
        io.stopped[idx] = true;
        let w = io.writers[idx].as_mut().with_context(|| format!("helper {} not started", idx))?;
        writeln!(w, "stop")?;
        w.flush()?;
        Ok(true)
    }

    /// Unconditional `stop`, used to resync a helper after corrupted
    /// output. Does not touch the stopped flag.
    pub fn send_stop_raw(&self, idx: usize) -> Result<()> {
        let mut io = self.io.lock().unwrap();
        let w = io.writers[idx].as_mut().with_context(|| format!("helper {} not started", idx))?;
        writeln!(w, "stop")?;
        w.flush()?;
        Ok(())
    }

    /// Query finished normally: mark the slot idle.
    pub fn mark_idle(&self, idx: usize) {
        self.io.lock().unwrap().stopped[idx] = true;
    }

    /// Cancel every computing helper. Errors are ignored: a helper that
    /// already died is as stopped as it gets.
    pub fn stop_all(&self) {
        for idx in 0..self.slots.len() {
            let _ = self.send_stop_once(idx);
        }
    }

    pub fn take_reader(&self, idx: usize) -> Option<BufReader<ChildStdout>> {
        self.slots[idx].lock().unwrap().reader.take()
    }

    pub fn put_reader(&self, idx: usize, reader: BufReader<ChildStdout>) {
        self.slots[idx].lock().unwrap().reader = Some(reader);
    }

    pub fn is_running(&self, idx: usize) -> Result<bool> {
        let mut slot = self.slots[idx].lock().unwrap();
        match slot.child.as_mut() {
            None => Ok(false),
            Some(child) => Ok(child.try_wait()?.is_none()),
        }
    }

    /// Close every stdin (helpers exit on EOF) and reap the children.
    pub fn shutdown(&self) {
        {
            let mut io = self.io.lock().unwrap();
            for w in io.writers.iter_mut() {
                *w = None;
            }
        }
        for slot in &self.slots {
            let mut slot = slot.lock().unwrap();
            slot.reader = None;
            slot.ready = false;
            if let Some(mut child) = slot.child.take() {
                let _ = child.wait();
            }
        }
    }
}
