/*
 *     Copyright 2025 The Dragonfly Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use tokio::sync::broadcast;

/// Shutdown is a cloneable handle over a broadcast channel: every task
/// holding one observes the same stop signal exactly once.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            is_shutdown: self.is_shutdown,
            notify: self.notify.resubscribe(),
        }
    }
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Self {
        Self {
            is_shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// recv waits for the shutdown signal, returning immediately on every
    /// call after the first.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

/// ShutdownTrigger is held by whichever task decides the server should
/// stop (the idle reaper); broadcasting drops every cloned `Shutdown`
/// out of its `recv` call simultaneously.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger(broadcast::Sender<()>);

impl ShutdownTrigger {
    pub fn new() -> (Self, Shutdown) {
        let (tx, rx) = broadcast::channel(1);
        (Self(tx), Shutdown::new(rx))
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown::new(self.0.subscribe())
    }

    pub fn trigger(&self) {
        let _ = self.0.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_every_subscriber() {
        let (trigger, mut a) = ShutdownTrigger::new();
        let mut b = trigger.subscribe();
        trigger.trigger();
        a.recv().await;
        b.recv().await;
        assert!(a.is_shutdown());
        assert!(b.is_shutdown());
    }

    #[tokio::test]
    async fn recv_after_shutdown_returns_immediately() {
        let (trigger, mut shutdown) = ShutdownTrigger::new();
        trigger.trigger();
        shutdown.recv().await;
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
    }
}
