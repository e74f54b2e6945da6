//! 传感器后台采样。

mod source;

pub(crate) use source::{Power, SensorPlan, Temperature};

use crate::{out_of_resources, Error};
use log::{debug, error, warn};
use std::{
    sync::{
        atomic::{
            AtomicU32, AtomicU8,
            Ordering::{Acquire, Relaxed, Release},
        },
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// 采样线程写入、任意线程读取的最新读数。
#[derive(Default, Debug)]
pub(crate) struct Telemetry {
    power: AtomicU32,
    temperature: AtomicU32,
}

impl Telemetry {
    #[inline]
    pub fn power(&self) -> f32 {
        f32::from_bits(self.power.load(Relaxed))
    }

    #[inline]
    pub fn temperature(&self) -> f32 {
        f32::from_bits(self.temperature.load(Relaxed))
    }

    #[inline]
    pub fn set_power(&self, value: f32) {
        self.power.store(value.to_bits(), Relaxed)
    }

    #[inline]
    pub fn set_temperature(&self, value: f32) {
        self.temperature.store(value.to_bits(), Relaxed)
    }
}

/// 采样线程状态。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SamplerState {
    Stopped = 0,
    Running = 1,
    Stopping = 2,
}

impl SamplerState {
    #[inline]
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// 每个资源一个的采样线程，释放时停止并等待线程退出。
pub(crate) struct Sampler {
    state: Arc<AtomicU8>,
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Sampler {
    /// 启动采样线程，找不到任何传感器时不启动。
    pub fn start(
        name: String,
        plan: SensorPlan,
        telemetry: Arc<Telemetry>,
        period: Duration,
    ) -> Result<Self, Error> {
        let state = Arc::new(AtomicU8::new(SamplerState::Stopped as _));
        if plan.is_empty() {
            warn!("{name}: no power or temperature sensor found");
            return Ok(Self {
                state,
                stop: None,
                thread: None,
            });
        }

        let (stop, signal) = mpsc::channel();
        state.store(SamplerState::Running as _, Release);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn({
                let state = state.clone();
                move || {
                    sample(&plan, &telemetry, period, signal);
                    state.store(SamplerState::Stopped as _, Release)
                }
            })
            .map_err(|e| {
                state.store(SamplerState::Stopped as _, Release);
                out_of_resources(format!("spawn sampler {name}: {e}"))
            })?;
        debug!("{name}: sampler started, period = {period:?}");
        Ok(Self {
            state,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    #[inline]
    pub fn state(&self) -> SamplerState {
        SamplerState::from_u8(self.state.load(Acquire))
    }

    /// 通知采样线程停止并等待其退出。
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.state.store(SamplerState::Stopping as _, Release);
        drop(self.stop.take());
        if thread.join().is_err() {
            error!("sampler thread panicked")
        }
        self.state.store(SamplerState::Stopped as _, Release)
    }
}

impl Drop for Sampler {
    #[inline]
    fn drop(&mut self) {
        self.stop()
    }
}

fn sample(
    plan: &SensorPlan,
    telemetry: &Telemetry,
    period: Duration,
    signal: mpsc::Receiver<()>,
) {
    loop {
        let start = Instant::now();
        plan.sample(telemetry);
        match signal.recv_timeout(period.saturating_sub(start.elapsed())) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
