//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use accel_sched::prelude::*;
use accel_sched::CompletionMode;

/// Install a test subscriber once; `RUST_LOG` controls the output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Runtime plus an initialized simulated device.
pub struct Fixture {
    pub runtime: Runtime,
    pub sim: Arc<SimDevice>,
    pub device: Arc<dyn Device>,
}

impl Fixture {
    pub fn new(config: SchedConfig, num_cus: usize, mode: CompletionMode) -> Self {
        init_tracing();
        let runtime = Runtime::new(config).unwrap();
        let sim = Arc::new(SimDevice::new(0, num_cus).with_completion_mode(mode));
        let device: Arc<dyn Device> = sim.clone();
        runtime.init_device(&device).unwrap();
        Self {
            runtime,
            sim,
            device,
        }
    }

    pub fn sws(num_cus: usize, mode: CompletionMode) -> Self {
        Self::new(SchedConfig::default(), num_cus, mode)
    }

    pub fn kds(num_cus: usize, mode: CompletionMode) -> Self {
        Self::new(SchedConfig::default().with_kds(true), num_cus, mode)
    }

    pub fn mbs(num_cus: usize, mode: CompletionMode) -> Self {
        Self::new(SchedConfig::default().with_ert(true), num_cus, mode)
    }

    pub fn kernel(&self, name: &str, access: AccessMode) -> Arc<Kernel> {
        Kernel::open(&self.runtime, &self.device, &self.sim.uuid(), name, access).unwrap()
    }

    pub fn command(&self, opcode: Opcode) -> Arc<Command> {
        self.runtime.command(&self.device, opcode).unwrap()
    }
}

/// Poll `cond` until it holds or `timeout` expires.
pub fn eventually<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
