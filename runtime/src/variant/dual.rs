use super::{build, xilinx, Image, Slot, Strategy, Transfer};
use crate::{
    format_error, invalid_argument, not_found, sensor::SensorPlan, Driver, Error, Fabric,
    Placement,
};
use accel_common::{
    container::Container,
    xclbin::{SectionKind, Xclbin},
    Topology,
};
use log::debug;
use std::{iter::zip, path::Path};

/// 两个 Xilinx 设备组成的资源。
///
/// 编程输入是按 512 字节分块的容器，依次为每个设备提供一个打包二进制，
/// 第 i 个成员编程第 i 个设备。成员以内嵌的构建 UUID 区分，不允许重复，
/// 拓扑取自打包二进制内嵌的存储拓扑分段。
pub(super) struct Dual {
    fabric: Box<dyn Fabric>,
}

impl Dual {
    #[inline]
    pub fn new(fabric: Box<dyn Fabric>) -> Self {
        Self { fabric }
    }
}

impl<D: Driver> Strategy<D> for Dual {
    #[inline]
    fn variant(&self) -> &'static str {
        "xilinx-dual"
    }

    #[inline]
    fn sensors(&self, root: &Path) -> SensorPlan {
        xilinx::sensors(root)
    }

    fn program(
        &self,
        driver: &D,
        slots: &[Slot<D>],
        _root: &Path,
        binary: &[u8],
    ) -> Result<Vec<Image<D>>, Error> {
        let members = Container::members(binary)?;
        if members.len() != slots.len() {
            return Err(format_error(format!(
                "container holds {} binaries for {} devices",
                members.len(),
                slots.len()
            )));
        }

        // 先解析全部成员，容器有误时不构建任何程序
        let mut parsed: Vec<(_, String, Topology)> = Vec::with_capacity(members.len());
        for member in &members {
            let xclbin = Xclbin::parse(member.data)?;
            let uuid = xclbin.uuid_string();
            if parsed.iter().any(|(_, other, _)| *other == uuid) {
                return Err(format_error(format!("{} repeats build {uuid}", member.name)));
            }
            let topology = xclbin
                .section(SectionKind::MemTopology)
                .ok_or_else(|| format_error(format!("{} has no memory topology", member.name)))?;
            parsed.push((member, uuid, Topology::parse(topology)?))
        }

        let mut images = Vec::with_capacity(slots.len());
        for (i, (slot, (member, uuid, topology))) in zip(slots, parsed).enumerate() {
            let program = build(driver, slot, member.data)?;
            debug!("device {i} programmed with {} ({uuid})", member.name);

            let mut image = Image::new(program, topology);
            image.binary = Some(member.stem().into());
            image.uuid = Some(uuid);
            images.push(image)
        }

        self.fabric.bring_up()?;
        Ok(images)
    }

    #[inline]
    fn placement(&self, bank: u32) -> Placement {
        Placement::Bank(bank)
    }

    #[inline]
    fn pins_pages(&self) -> bool {
        true
    }

    #[inline]
    fn transfer(&self) -> Transfer {
        Transfer::Migrate
    }

    /// 名字形如 `<kernel>-<binary>`，`binary` 是成员名或构建 UUID。
    fn resolve<'n>(
        &self,
        images: &[Image<D>],
        name: &'n str,
    ) -> Result<(usize, &'n str), Error> {
        let Some((kernel, binary)) = name.split_once('-') else {
            return Err(invalid_argument(format!(
                "\"{name}\" is not in <kernel>-<binary> form"
            )));
        };
        images
            .iter()
            .position(|image| {
                image.binary.as_deref() == Some(binary) || image.uuid.as_deref() == Some(binary)
            })
            .map(|slot| (slot, kernel))
            .ok_or_else(|| not_found(format!("no binary \"{binary}\" provides {kernel}")))
    }
}
