//! 双设备网络互联的初始化协议。
//!
//! 每次双设备资源编程成功后调用一次 [Fabric::bring_up]，任何失败都使编程失败。

use crate::{fabric_failed, Error};
use log::debug;
use std::net::Ipv4Addr;

/// 互联初始化。
pub trait Fabric: Send + Sync {
    fn bring_up(&self) -> Result<(), Error>;
}

/// 网络层寄存器访问。
pub trait Registers: Send + Sync {
    fn read(&self, offset: u32) -> Result<u32, Error>;
    fn write(&self, offset: u32, value: u32) -> Result<(), Error>;
}

/// 套接字表容量。
pub const SOCKETS: usize = 16;

pub mod offset {
    pub const MAC_LOW: u32 = 0x0010;
    pub const MAC_HIGH: u32 = 0x0014;
    pub const IP: u32 = 0x0018;
    pub const GATEWAY: u32 = 0x001c;
    pub const MASK: u32 = 0x0020;
    pub const LINK_STATUS: u32 = 0x0204;
    pub const NUM_SOCKETS: u32 = 0x0210;
    pub const PEER_IP: u32 = 0x0810;
    pub const PEER_PORT: u32 = 0x0890;
    pub const LOCAL_PORT: u32 = 0x0910;
    pub const VALID: u32 = 0x0990;
    pub const ARP_DISCOVERY: u32 = 0x3010;
    /// 套接字表项间距。
    pub const STRIDE: u32 = 8;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Socket {
    pub peer_ip: Ipv4Addr,
    pub peer_port: u16,
    pub local_port: u16,
    pub valid: bool,
}

impl Default for Socket {
    #[inline]
    fn default() -> Self {
        Self {
            peer_ip: Ipv4Addr::UNSPECIFIED,
            peer_port: 0,
            local_port: 0,
            valid: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub mac: [u8; 6],
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub sockets: [Socket; SOCKETS],
}

/// 通过寄存器表完成互联初始化。
pub struct RegisterFabric<R> {
    registers: R,
    config: NetworkConfig,
}

impl<R: Registers> RegisterFabric<R> {
    #[inline]
    pub fn new(registers: R, config: NetworkConfig) -> Self {
        Self { registers, config }
    }

    #[inline]
    pub fn registers(&self) -> &R {
        &self.registers
    }

    /// 链路状态寄存器最低位表示链路已建立。
    pub fn link_up(&self) -> Result<bool, Error> {
        Ok(self.registers.read(offset::LINK_STATUS)? & 1 == 1)
    }
}

impl<R: Registers> Fabric for RegisterFabric<R> {
    fn bring_up(&self) -> Result<(), Error> {
        use offset::*;

        let NetworkConfig {
            mac,
            ip,
            gateway,
            mask,
            ref sockets,
        } = self.config;
        let r = &self.registers;

        let [m0, m1, m2, m3, m4, m5] = mac;
        r.write(MAC_LOW, u32::from_be_bytes([m2, m3, m4, m5]))?;
        r.write(MAC_HIGH, u32::from_be_bytes([0, 0, m0, m1]))?;
        r.write(IP, ip.into())?;
        r.write(GATEWAY, gateway.into())?;
        r.write(MASK, mask.into())?;

        for (i, socket) in (0..).zip(sockets) {
            let base = i * STRIDE;
            r.write(PEER_IP + base, socket.peer_ip.into())?;
            r.write(PEER_PORT + base, socket.peer_port as _)?;
            r.write(LOCAL_PORT + base, socket.local_port as _)?;
            r.write(VALID + base, socket.valid as _)?;
        }
        r.write(NUM_SOCKETS, SOCKETS as _)?;

        r.write(ARP_DISCOVERY, 0)?;
        r.write(ARP_DISCOVERY, 1)?;

        if self.link_up()? {
            debug!("fabric {ip} is up");
            Ok(())
        } else {
            Err(fabric_failed(format!("link of {ip} is down")))
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::{collections::HashMap, sync::Mutex};

    /// 内存中的寄存器表。
    #[derive(Default)]
    pub struct MockRegisters(pub Mutex<HashMap<u32, u32>>);

    impl Registers for MockRegisters {
        fn read(&self, offset: u32) -> Result<u32, Error> {
            Ok(*self.0.lock().unwrap().get(&offset).unwrap_or(&0))
        }
        fn write(&self, offset: u32, value: u32) -> Result<(), Error> {
            self.0.lock().unwrap().insert(offset, value);
            Ok(())
        }
    }

    pub fn config() -> NetworkConfig {
        let mut sockets = [Socket::default(); SOCKETS];
        sockets[0] = Socket {
            peer_ip: Ipv4Addr::new(10, 0, 0, 2),
            peer_port: 5001,
            local_port: 5000,
            valid: true,
        };
        NetworkConfig {
            mac: [0x00, 0x0a, 0x35, 0x02, 0x9d, 0xe5],
            ip: Ipv4Addr::new(10, 0, 0, 1),
            gateway: Ipv4Addr::new(10, 0, 0, 254),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            sockets,
        }
    }

    pub fn fabric(link: bool) -> RegisterFabric<MockRegisters> {
        let registers = MockRegisters::default();
        registers.write(offset::LINK_STATUS, link as _).unwrap();
        RegisterFabric::new(registers, config())
    }

    #[test]
    fn test_bring_up() {
        let fabric = fabric(true);
        fabric.bring_up().unwrap();

        let regs = fabric.registers().0.lock().unwrap();
        assert_eq!(regs[&offset::MAC_LOW], 0x0235_9de5);
        assert_eq!(regs[&offset::MAC_HIGH], 0x000a);
        assert_eq!(regs[&offset::IP], 0x0a00_0001);
        assert_eq!(regs[&offset::MASK], 0xffff_ff00);
        assert_eq!(regs[&offset::PEER_IP], 0x0a00_0002);
        assert_eq!(regs[&offset::PEER_PORT], 5001);
        assert_eq!(regs[&offset::LOCAL_PORT], 5000);
        assert_eq!(regs[&offset::VALID], 1);
        assert_eq!(regs[&(offset::VALID + offset::STRIDE)], 0);
        assert_eq!(regs[&offset::NUM_SOCKETS], 16);
        assert_eq!(regs[&offset::ARP_DISCOVERY], 1);
    }

    #[test]
    fn test_link_down() {
        let e = fabric(false).bring_up().unwrap_err();
        assert_eq!(e.kind, crate::ErrorKind::Fabric);
    }
}
