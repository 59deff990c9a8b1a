// src/client_pool.rs
use reqwest::blocking::Client;
use reqwest::redirect;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Fixed-size pool of HTTP/1.1 clients. Each slot is one client with its
/// own connection universe, so keep-alive actually pins one upstream TCP
/// connection per slot instead of letting a shared client fan out.
///
/// Two usage modes:
/// - `get()`: round-robin slot plus its guard; the caller holds the guard
///   for the duration of the call so concurrent senders never share a slot.
/// - `pinned(worker_id)`: lock-free access for worker-per-slot setups where
///   distinct workers own distinct slots by construction.
pub struct ClientPool {
    slots: Vec<Slot>,
    cursor: Mutex<usize>,
}

struct Slot {
    client: Client,
    lock: Mutex<()>,
}

/// Stop at the first redirect and surface it as an error; a mirrored
/// request must never walk off to a location the staging target chose.
pub fn build_client(timeout: Duration) -> anyhow::Result<Client> {
    let client = Client::builder()
        .redirect(redirect::Policy::custom(|attempt| {
            attempt.error("stopped after a redirect")
        }))
        .timeout(timeout)
        .pool_max_idle_per_host(1)
        .build()?;
    Ok(client)
}

impl ClientPool {
    pub fn new(size: usize, timeout: Duration) -> anyhow::Result<Self> {
        anyhow::ensure!(size > 0, "client pool size must be > 0");
        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            slots.push(Slot {
                client: build_client(timeout)?,
                lock: Mutex::new(()),
            });
        }
        Ok(Self { slots, cursor: Mutex::new(0) })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Next slot by round robin. The returned guard serializes callers on
    /// the slot; hold it across the whole request.
    pub fn get(&self) -> (&Client, MutexGuard<'_, ()>) {
        let index = {
            let mut cursor = self.cursor.lock().unwrap();
            let index = *cursor;
            *cursor = (*cursor + 1) % self.slots.len();
            index
        };
        let slot = &self.slots[index];
        (&slot.client, slot.lock.lock().unwrap())
    }

    /// The slot a pinned worker owns outright.
    pub fn pinned(&self, worker_id: usize) -> &Client {
        &self.slots[worker_id % self.slots.len()].client
    }
}
