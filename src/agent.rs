// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Agent runtime: wires a transport, the dispatcher and the reply pump
// into worker threads with explicit cancellation.
//
// Three worker classes exist: the transport's own listener (stream
// transports), one reader that drives recv and dispatches, and one reply
// pump started at init and stopped through a queue sentinel. Handlers run
// on the reader thread; transport sends never hold dispatcher locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::Receiver;

use crate::config::AgentConfig;
use crate::dispatcher::{reply_channel, Dispatcher, ReplyCommand, ReplySender};
use crate::protocol::AgentError;
use crate::proxy::DdsFacade;
use crate::transport::Transport;

/// Poll granularity of the reader thread.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// The XRCE agent: terminates the client protocol and multiplexes client
/// intent onto the DDS middleware behind [`DdsFacade`].
pub struct XrceAgent {
    config: AgentConfig,
    dispatcher: Arc<Dispatcher>,
    replies: ReplySender,
    reply_rx: Mutex<Option<Receiver<ReplyCommand>>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl XrceAgent {
    /// Create an agent over the given middleware facade.
    pub fn new(config: AgentConfig, facade: Arc<dyn DdsFacade>) -> Result<Self, AgentError> {
        config.validate()?;
        let (replies, reply_rx) = reply_channel(config.reply_queue_depth);
        let dispatcher = Arc::new(Dispatcher::new(config.clone(), facade, replies.clone()));
        Ok(Self {
            config,
            dispatcher,
            replies,
            reply_rx: Mutex::new(Some(reply_rx)),
            transport: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Spawn the reader and reply pump over `transport`. Returns
    /// immediately; the workers run until [`stop`](Self::stop).
    pub fn start(&self, transport: Arc<dyn Transport>) -> Result<(), AgentError> {
        let reply_rx = match self.reply_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(e) => e.into_inner().take(),
        };
        let reply_rx = reply_rx.ok_or_else(|| AgentError::Config("agent already started".into()))?;

        self.running.store(true, Ordering::Release);
        match self.transport.lock() {
            Ok(mut slot) => *slot = Some(Arc::clone(&transport)),
            Err(e) => *e.into_inner() = Some(Arc::clone(&transport)),
        }

        let mut workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        };

        // Reply pump: single long-lived worker, terminated by sentinel.
        {
            let transport = Arc::clone(&transport);
            workers.push(
                thread::Builder::new()
                    .name("xrce-reply".into())
                    .spawn(move || reply_pump(transport, reply_rx))
                    .map_err(|e| AgentError::Io(e.to_string()))?,
            );
        }

        // Reader: drives recv and dispatches on its own thread.
        {
            let transport = Arc::clone(&transport);
            let dispatcher = Arc::clone(&self.dispatcher);
            let running = Arc::clone(&self.running);
            let max = self.config.max_message_size;
            workers.push(
                thread::Builder::new()
                    .name("xrce-reader".into())
                    .spawn(move || reader_loop(transport, dispatcher, running, max))
                    .map_err(|e| AgentError::Io(e.to_string()))?,
            );
        }

        log::info!("agent running");
        Ok(())
    }

    /// Stop all workers and tear down every session. Idempotent; returns
    /// once every worker has joined.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let transport = match self.transport.lock() {
            Ok(mut slot) => slot.take(),
            Err(e) => e.into_inner().take(),
        };
        if let Some(transport) = &transport {
            transport.shutdown();
        }
        self.replies.send_shutdown();
        let workers = {
            let mut guard = match self.workers.lock() {
                Ok(guard) => guard,
                Err(e) => e.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            if worker.join().is_err() {
                log::warn!("worker thread panicked during shutdown");
            }
        }
        self.dispatcher.teardown_all();
        log::info!("agent stopped");
    }
}

impl Drop for XrceAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_loop(
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    running: Arc<AtomicBool>,
    max_message_size: usize,
) {
    let mut buf = vec![0u8; max_message_size];
    while running.load(Ordering::Acquire) {
        match transport.recv(&mut buf, RECV_TIMEOUT) {
            Ok(Some((len, source))) => dispatcher.on_message(&source, &buf[..len]),
            Ok(None) => {}
            Err(e) => log::debug!("transport recv: {}", e),
        }
        for endpoint in transport.drain_closed() {
            dispatcher.unbind_endpoint(&endpoint);
        }
    }
}

fn reply_pump(transport: Arc<dyn Transport>, rx: Receiver<ReplyCommand>) {
    while let Ok(command) = rx.recv() {
        match command {
            ReplyCommand::Send { endpoint, bytes } => {
                if let Err(e) = transport.send(&endpoint, &bytes) {
                    log::warn!("send to {} failed: {}", endpoint, e);
                }
            }
            ReplyCommand::Shutdown => break,
        }
    }
}
