use crate::{
    error::Checked,
    not_found,
    sensor::{Sampler, SamplerState, Telemetry},
    stale,
    variant::{Image, Located, Slot, Strategy},
    Config, Driver, Error, Variant,
};
use accel_common::{Identity, Topology, Vendor};
use log::{debug, error, warn};
use std::{
    path::Path,
    sync::{
        atomic::{
            AtomicU64,
            Ordering::{Acquire, Release},
        },
        Arc, PoisonError, RwLock, RwLockReadGuard,
    },
};

/// 一个可编程加速资源。
///
/// 打开时获取设备和上下文、解析身份并启动采样线程；释放时先停止采样线程。
/// 由它创建的存储、缓冲区和计算单元持有资源的共享状态，可以比资源句柄活得更久，
/// 但资源重新编程后它们全部失效。
pub struct Resource<D: Driver> {
    sampler: Sampler,
    inner: Arc<Inner<D>>,
}

pub(crate) struct Inner<D: Driver> {
    pub driver: Arc<D>,
    pub strategy: Box<dyn Strategy<D>>,
    pub index: usize,
    pub located: Located,
    pub telemetry: Arc<Telemetry>,
    generation: AtomicU64,
    /// 程序先于上下文释放。
    images: RwLock<Vec<Image<D>>>,
    pub slots: Vec<Slot<D>>,
}

impl<D: Driver> Inner<D> {
    /// 每次编程递增。
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Acquire)
    }

    /// 当前安装的程序和拓扑。
    #[inline]
    pub fn images(&self) -> RwLockReadGuard<Vec<Image<D>>> {
        self.images.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// 检查句柄是否创建于当前程序之下。
    pub fn check(&self, generation: u64, what: &str) -> Result<(), Error> {
        if self.generation() == generation {
            Ok(())
        } else {
            Err(stale(format!(
                "{what} was created before {} was reprogrammed",
                self.located.identity
            )))
        }
    }
}

impl<D: Driver> Resource<D> {
    /// 打开 `variant` 平台上序号为 `index` 的资源，双设备变体占用设备 `2 * index` 和 `2 * index + 1`。
    pub fn open(
        driver: Arc<D>,
        variant: Variant,
        index: usize,
        config: &Config,
    ) -> Result<Self, Error> {
        let vendor = variant.vendor();
        let n = variant.devices();
        let devices = index
            .checked_mul(n)
            .and_then(|first| first.checked_add(n).map(|end| first..end))
            .ok_or_else(|| not_found(format!("{vendor} resource {index}")))?;

        let mut slots = Vec::with_capacity(n);
        for i in devices {
            let device = driver
                .device(vendor.platform(), i)
                .checked("clGetDeviceIDs")?
                .ok_or_else(|| not_found(format!("{vendor} device {i}")))?;
            let context = driver.create_context(&device).checked("clCreateContext")?;
            slots.push(Slot { device, context })
        }

        let located = variant
            .locate(&*driver, &slots[0].device, config)
            .inspect_err(|e| error!("open {vendor} resource {index}: {e}"))?;
        let strategy = variant.into_strategy::<D>();

        let telemetry = Arc::new(Telemetry::default());
        let sampler = Sampler::start(
            format!("{}-{index}", strategy.variant()),
            strategy.sensors(&located.root),
            telemetry.clone(),
            config.sample_period,
        )?;
        debug!("open {} at {}", located.identity, located.root.display());

        Ok(Self {
            sampler,
            inner: Arc::new(Inner {
                driver,
                strategy,
                index,
                located,
                telemetry,
                generation: AtomicU64::new(0),
                images: RwLock::new(Vec::new()),
                slots,
            }),
        })
    }

    /// 以二进制编程资源，替换之前的程序和拓扑。
    ///
    /// 之前的程序在加载新程序前释放，因此失败后资源处于未编程状态。
    /// 无论成败，之前创建的存储、缓冲区和计算单元都失效。
    pub fn program(&self, binary: &[u8]) -> Result<(), Error> {
        let inner = &*self.inner;
        let mut images = inner.images.write().unwrap_or_else(PoisonError::into_inner);
        inner.generation.fetch_add(1, Release);
        images.clear();

        match inner
            .strategy
            .program(&inner.driver, &inner.slots, &inner.located.root, binary)
        {
            Ok(new) => {
                *images = new;
                debug!(
                    "{} programmed, {} banks",
                    inner.located.identity,
                    images.iter().map(|i| i.topology.len()).sum::<usize>()
                );
                Ok(())
            }
            Err(e) => {
                error!("program {}: {e}", inner.located.identity);
                Err(e)
            }
        }
    }

    #[inline]
    pub(crate) fn inner(&self) -> &Arc<Inner<D>> {
        &self.inner
    }

    #[inline]
    pub fn identity(&self) -> &Identity {
        &self.inner.located.identity
    }

    #[inline]
    pub fn vendor(&self) -> Vendor {
        self.inner.located.identity.vendor
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.located.identity.name
    }

    #[inline]
    pub fn version(&self) -> &str {
        &self.inner.located.identity.version
    }

    /// `vendor | name | version` 形式的描述。
    #[inline]
    pub fn info(&self) -> String {
        self.inner.located.identity.to_string()
    }

    #[inline]
    pub fn serial_no(&self) -> Option<&str> {
        self.inner.located.serial_no.as_deref()
    }

    #[inline]
    pub fn pci_id(&self) -> Option<&str> {
        self.inner.located.pci_id.as_deref()
    }

    /// 遥测和拓扑文件所在的目录。
    #[inline]
    pub fn root(&self) -> &Path {
        &self.inner.located.root
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.inner.index
    }

    #[inline]
    pub fn devices(&self) -> usize {
        self.inner.slots.len()
    }

    /// 最近一次采样的功率（瓦），不会阻塞。
    #[inline]
    pub fn power(&self) -> f32 {
        self.inner.telemetry.power()
    }

    /// 最近一次采样的温度（摄氏度），不会阻塞。
    #[inline]
    pub fn temperature(&self) -> f32 {
        self.inner.telemetry.temperature()
    }

    #[inline]
    pub fn sampler_state(&self) -> SamplerState {
        self.sampler.state()
    }

    #[inline]
    pub fn is_programmed(&self) -> bool {
        !self.inner.images().is_empty()
    }

    /// 设备 `slot` 当前的存储拓扑。
    pub fn topology(&self, slot: usize) -> Option<Topology> {
        self.inner.images().get(slot).map(|i| i.topology.clone())
    }
}

/// 不打开资源，尽力获取序号为 `index` 的资源的身份，失败时返回占位身份。
pub fn describe<D: Driver>(
    driver: &D,
    variant: &Variant,
    index: usize,
    config: &Config,
) -> Identity {
    let vendor = variant.vendor();
    let located = index
        .checked_mul(variant.devices())
        .ok_or_else(|| not_found(format!("{vendor} resource {index}")))
        .and_then(|i| {
            driver
                .device(vendor.platform(), i)
                .checked("clGetDeviceIDs")?
                .ok_or_else(|| not_found(format!("{vendor} device {i}")))
        })
        .and_then(|device| variant.locate(driver, &device, config));
    match located {
        Ok(located) => located.identity,
        Err(e) => {
            warn!("describe {vendor} resource {index}: {e}");
            Identity::placeholder(vendor)
        }
    }
}
