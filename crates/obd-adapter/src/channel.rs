//! Single-channel bookkeeping shared by all adapters
//!
//! An adapter owns at most one open channel. Handles are never reused, so a
//! handle held across a reconnect is detected as stale.

use crate::error::{AdapterError, AdapterResult};
use obd_protocol::Transport;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::watch;

/// Opaque id of an open channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelHandle(u32);

impl ChannelHandle {
    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel#{}", self.0)
    }
}

#[derive(Debug)]
struct OpenChannel {
    handle: ChannelHandle,
    transport: Transport,
    cancel: watch::Sender<bool>,
}

/// The one open channel of an adapter
#[derive(Debug)]
pub struct ChannelSlot {
    current: Mutex<Option<OpenChannel>>,
    next_id: AtomicU32,
}

impl Default for ChannelSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelSlot {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            next_id: AtomicU32::new(1),
        }
    }

    /// Register a new channel. The caller has already closed the previous
    /// one on the device; any waiter on it is cancelled here.
    pub fn open(&self, transport: Transport) -> ChannelHandle {
        let handle = ChannelHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (cancel, _) = watch::channel(false);
        let previous = self.current.lock().replace(OpenChannel {
            handle,
            transport,
            cancel,
        });
        if let Some(old) = previous {
            old.cancel.send_replace(true);
        }
        handle
    }

    /// Transport of the open channel, if `handle` names it
    pub fn check(&self, handle: ChannelHandle) -> AdapterResult<Transport> {
        match self.current.lock().as_ref() {
            Some(open) if open.handle == handle => Ok(open.transport),
            Some(_) => Err(AdapterError::InvalidChannel(handle.id())),
            None => Err(AdapterError::ChannelClosed),
        }
    }

    /// Close the channel named by `handle` and wake its waiters
    pub fn close(&self, handle: ChannelHandle) -> AdapterResult<Transport> {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some(open) if open.handle == handle => {}
            Some(_) => return Err(AdapterError::InvalidChannel(handle.id())),
            None => return Err(AdapterError::ChannelClosed),
        }
        let open = current.take().ok_or(AdapterError::ChannelClosed)?;
        open.cancel.send_replace(true);
        Ok(open.transport)
    }

    /// Close whatever is open
    pub fn close_any(&self) -> Option<ChannelHandle> {
        let open = self.current.lock().take()?;
        open.cancel.send_replace(true);
        Some(open.handle)
    }

    pub fn handle(&self) -> Option<ChannelHandle> {
        self.current.lock().as_ref().map(|open| open.handle)
    }

    pub fn transport(&self) -> Option<Transport> {
        self.current.lock().as_ref().map(|open| open.transport)
    }

    pub fn is_open(&self, handle: ChannelHandle) -> bool {
        self.check(handle).is_ok()
    }

    fn subscribe(&self, handle: ChannelHandle) -> AdapterResult<watch::Receiver<bool>> {
        match self.current.lock().as_ref() {
            Some(open) if open.handle == handle => Ok(open.cancel.subscribe()),
            Some(_) => Err(AdapterError::InvalidChannel(handle.id())),
            None => Err(AdapterError::ChannelClosed),
        }
    }

    /// Run `op` on the channel, failing with `Cancelled` if the channel is
    /// closed before it finishes.
    pub async fn with_cancel<T, F>(&self, handle: ChannelHandle, op: F) -> AdapterResult<T>
    where
        F: Future<Output = AdapterResult<T>>,
    {
        let mut cancelled = self.subscribe(handle)?;
        tokio::select! {
            result = op => result,
            _ = cancelled.wait_for(|closed| *closed) => Err(AdapterError::Cancelled),
        }
    }
}
