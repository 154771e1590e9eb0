//! VCPU worker threads.
//!
//! KVM expects a VCPU to be driven from the thread that created it. Each
//! [`VcpuHandle`] owns one such thread; everything the rest of the crate does
//! with a VCPU is shipped to that thread as a job and the result comes back
//! over a oneshot channel.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::backend::kvm::{Vcpu, Vm};
use crate::error::{Error, Result};

type Job = Box<dyn FnOnce(&mut Vcpu) + Send>;

/// Owner of one VCPU and the thread it lives on.
pub struct VcpuHandle {
    id: usize,
    jobs: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl VcpuHandle {
    /// Start a thread named `vcpu{id}`, create the VCPU on it and run `setup`.
    ///
    /// Returns once the VCPU exists and `setup` succeeded.
    pub fn spawn<F>(id: usize, vm: Arc<Vm>, setup: F) -> Result<Self>
    where
        F: FnOnce(&Vcpu) -> Result<()> + Send + 'static,
    {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let thread = thread::Builder::new()
            .name(format!("vcpu{}", id))
            .spawn(move || {
                let created = vm
                    .create_vcpu(id)
                    .and_then(|vcpu| setup(&vcpu).map(|()| vcpu));
                let mut vcpu = match created {
                    Ok(vcpu) => {
                        let _ = ready_tx.send(Ok(()));
                        vcpu
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                debug!(target: "sandvisor::vcpu", vcpu = id, "worker started");
                while let Some(job) = queue.blocking_recv() {
                    job(&mut vcpu);
                }
                debug!(target: "sandvisor::vcpu", vcpu = id, "worker exiting");
            })?;

        let handle = Self {
            id,
            jobs: Some(jobs),
            thread: Some(thread),
        };
        ready_rx.blocking_recv().map_err(|_| Error::VcpuGone(id))??;
        Ok(handle)
    }

    /// Index of this VCPU.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Queue `f` on the VCPU thread without waiting for it.
    pub fn submit<T, F>(&self, f: F) -> Result<oneshot::Receiver<T>>
    where
        F: FnOnce(&mut Vcpu) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |vcpu| {
            let _ = tx.send(f(vcpu));
        });
        self.jobs
            .as_ref()
            .ok_or(Error::VcpuGone(self.id))?
            .send(job)
            .map_err(|_| Error::VcpuGone(self.id))?;
        Ok(rx)
    }

    /// Run `f` on the VCPU thread and wait for its result.
    ///
    /// Jobs run in order, so this blocks for as long as an earlier job (such
    /// as a run loop) keeps the thread busy.
    pub fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vcpu) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(f)?
            .blocking_recv()
            .map_err(|_| Error::VcpuGone(self.id))?
    }
}

impl Drop for VcpuHandle {
    fn drop(&mut self) {
        // Closing the queue ends the worker loop.
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(target: "sandvisor::vcpu", vcpu = self.id, "worker panicked");
            }
        }
    }
}
