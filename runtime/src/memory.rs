use crate::{
    error::Checked, not_found, resource::Inner, Access, BufferDesc, Driver, Error, MemKind,
    Resource, PAGE,
};
use log::trace;
use std::{ptr::null_mut, sync::Arc};

/// 资源当前拓扑中的一个已用存储区。
///
/// 在固定页的变体上，存储区打开时分配一个页大小的隐式缓冲区，
/// 绑定到计算单元的缓冲区参数上时由它维持存储区亲和性，
/// 因此可用容量少一页。
pub struct Memory<D: Driver>(Arc<MemoryInner<D>>);

struct MemoryInner<D: Driver> {
    page: Option<D::Mem>,
    resource: Arc<Inner<D>>,
    generation: u64,
    index: usize,
    slot: usize,
    bank: u32,
    size: usize,
    kind: MemKind,
    memory_type: String,
}

impl<D: Driver> Clone for Memory<D> {
    #[inline]
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<D: Driver> Memory<D> {
    /// 按全局序号打开存储区。双设备资源的序号空间是两个设备拓扑的拼接。
    ///
    /// 序号越界或存储区未使用时返回“未找到”。
    pub fn open(resource: &Resource<D>, index: usize) -> Result<Self, Error> {
        let inner = resource.inner();
        let images = inner.images();
        let generation = inner.generation();
        if images.is_empty() {
            return Err(not_found(format!(
                "memory {index}: {} is not programmed",
                resource.identity()
            )));
        }

        let mut local = index;
        let (slot, bank) = images
            .iter()
            .enumerate()
            .find_map(|(slot, image)| match image.topology.bank(local) {
                Some(bank) => Some((slot, bank)),
                None => {
                    local -= image.topology.len();
                    None
                }
            })
            .ok_or_else(|| not_found(format!("memory {index} is out of range")))?;
        if !bank.used {
            return Err(not_found(format!("memory {index} is not used")));
        }
        let bank_size = bank.size();
        let kind = bank.kind;
        let memory_type = bank.memory_type().to_string();
        drop(images);

        let local = local as u32;
        let size = usize::try_from(bank_size)
            .map_err(|_| not_found(format!("memory {index} is too large for the host")))?;
        let strategy = &inner.strategy;
        let (page, size) = if strategy.pins_pages() {
            let desc = BufferDesc {
                size: PAGE,
                placement: strategy.placement(local),
                access: Access::WriteOnly,
                host: null_mut(),
            };
            let page = unsafe { inner.driver.create_buffer(&inner.slots[slot].context, &desc) }
                .checked("clCreateBuffer(page)")?;
            (Some(page), size.saturating_sub(PAGE))
        } else {
            (None, size)
        };
        trace!("open memory {index} at device {slot} bank {local}, {size} bytes");

        Ok(Self(Arc::new(MemoryInner {
            page,
            resource: inner.clone(),
            generation,
            index,
            slot,
            bank: local,
            size,
            kind,
            memory_type,
        })))
    }

    /// 全局序号。
    #[inline]
    pub fn index(&self) -> usize {
        self.0.index
    }

    /// 可用字节数。
    #[inline]
    pub fn size(&self) -> usize {
        self.0.size
    }

    /// 归一化的存储类型，如 `DDR`、`HBM`。
    #[inline]
    pub fn memory_type(&self) -> &str {
        &self.0.memory_type
    }

    #[inline]
    pub fn kind(&self) -> MemKind {
        self.0.kind
    }

    /// 存储区所在设备的序号。
    #[inline]
    pub fn slot(&self) -> usize {
        self.0.slot
    }

    /// 设备内的存储区序号。
    #[inline]
    pub fn bank(&self) -> u32 {
        self.0.bank
    }

    /// 资源在存储区打开后被重新编程过。
    #[inline]
    pub fn is_stale(&self) -> bool {
        self.0.resource.generation() != self.0.generation
    }

    #[inline]
    pub(crate) fn check(&self) -> Result<(), Error> {
        self.0
            .resource
            .check(self.0.generation, &format!("memory {}", self.0.index))
    }

    #[inline]
    pub(crate) fn page(&self) -> Option<&D::Mem> {
        self.0.page.as_ref()
    }

    #[inline]
    pub(crate) fn resource(&self) -> &Arc<Inner<D>> {
        &self.0.resource
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        resource::test::{dual, intel, link, xilinx, MIB, VADD},
        ErrorKind,
    };

    #[test]
    fn test_xilinx() {
        let f = xilinx();
        let resource = Resource::open(f.cpu.clone(), crate::Variant::Xilinx, 0, &f.config).unwrap();
        assert!(Memory::open(&resource, 0).err().unwrap().is_not_found());

        resource.program(VADD).unwrap();
        let ddr = Memory::open(&resource, 0).unwrap();
        assert_eq!(ddr.size(), MIB as usize - PAGE);
        assert_eq!(ddr.memory_type(), "DDR");
        assert_eq!(ddr.kind(), MemKind::Ddr4);
        assert_eq!((ddr.slot(), ddr.bank()), (0, 0));
        assert!(ddr.page().is_some());

        let hbm = Memory::open(&resource, 2).unwrap();
        assert_eq!(hbm.size(), 64 * 1024 - PAGE);
        assert_eq!(hbm.memory_type(), "HBM");
        assert_eq!(hbm.bank(), 2);

        assert!(Memory::open(&resource, 1).err().unwrap().is_not_found());
        assert!(Memory::open(&resource, 3).err().unwrap().is_not_found());

        // 上下文、程序和两个页
        assert_eq!(f.cpu.live(), 4);
        drop(hbm);
        assert_eq!(f.cpu.live(), 3);
    }

    #[test]
    fn test_intel() {
        let f = intel();
        let resource = Resource::open(f.cpu.clone(), crate::Variant::Intel, 0, &f.config).unwrap();
        resource.program(VADD).unwrap();
        let memory = Memory::open(&resource, 0).unwrap();
        assert_eq!(memory.size(), 8 * MIB as usize);
        assert_eq!(memory.memory_type(), "DDR");
        assert!(memory.page().is_none());
        assert!(Memory::open(&resource, 1).err().unwrap().is_not_found());
    }

    #[test]
    fn test_dual() {
        let (f, container) = dual();
        let resource = Resource::open(f.cpu.clone(), link(true), 0, &f.config).unwrap();
        resource.program(&container).unwrap();

        let m = Memory::open(&resource, 1).unwrap();
        assert_eq!((m.slot(), m.bank()), (0, 1));
        let m = Memory::open(&resource, 2).unwrap();
        assert_eq!((m.slot(), m.bank()), (1, 0));
        assert_eq!(m.size(), 2 * MIB as usize - PAGE);
        assert!(Memory::open(&resource, 3).err().unwrap().is_not_found());
    }

    #[test]
    fn test_stale() {
        let f = xilinx();
        let resource = Resource::open(f.cpu.clone(), crate::Variant::Xilinx, 0, &f.config).unwrap();
        resource.program(VADD).unwrap();
        let memory = Memory::open(&resource, 0).unwrap();
        assert!(!memory.is_stale());
        memory.check().unwrap();

        resource.program(VADD).unwrap();
        assert!(memory.is_stale());
        assert_eq!(memory.check().unwrap_err().kind, ErrorKind::Stale);
        assert!(!Memory::open(&resource, 0).unwrap().is_stale());
    }
}
