//! 存储拓扑。
//!
//! | field    | type              | offset |
//! |:--------:|:-----------------:|:------:|
//! | count    | i32               | 0      |
//! | padding  | [u8; 4]           | 4      |
//! | banks    | [MemData; count]  | 8      |
//!
//! 每个 `MemData` 40 字节，8 字节对齐：
//!
//! | field    | type     | offset |
//! |:--------:|:--------:|:------:|
//! | type     | u8       | 0      |
//! | used     | u8       | 1      |
//! | padding  | [u8; 6]  | 2      |
//! | size_kb  | u64      | 8      |
//! | base     | u64      | 16     |
//! | tag      | [u8; 16] | 24     |

use crate::{bad_field, truncated, FormatError};

const HEADER: usize = 8;
const RECORD: usize = 40;
const TAG: usize = 16;
/// 字节数仍能用 `u64` 表示的最大容量。
const MAX_SIZE_KB: u64 = u64::MAX / 1024;

/// 存储类型字节的含义。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemKind {
    Ddr3,
    Ddr4,
    Dram,
    Streaming,
    PreallocatedGlobal,
    Are,
    Hbm,
    Bram,
    Uram,
    StreamingConnection,
    Host,
    Unknown(u8),
}

impl From<u8> for MemKind {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Ddr3,
            1 => Self::Ddr4,
            2 => Self::Dram,
            3 => Self::Streaming,
            4 => Self::PreallocatedGlobal,
            5 => Self::Are,
            6 => Self::Hbm,
            7 => Self::Bram,
            8 => Self::Uram,
            9 => Self::StreamingConnection,
            10 => Self::Host,
            x => Self::Unknown(x),
        }
    }
}

impl From<MemKind> for u8 {
    fn from(value: MemKind) -> Self {
        match value {
            MemKind::Ddr3 => 0,
            MemKind::Ddr4 => 1,
            MemKind::Dram => 2,
            MemKind::Streaming => 3,
            MemKind::PreallocatedGlobal => 4,
            MemKind::Are => 5,
            MemKind::Hbm => 6,
            MemKind::Bram => 7,
            MemKind::Uram => 8,
            MemKind::StreamingConnection => 9,
            MemKind::Host => 10,
            MemKind::Unknown(x) => x,
        }
    }
}

/// 一个存储区。
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MemBank {
    pub kind: MemKind,
    pub used: bool,
    pub size_kb: u64,
    pub base_address: u64,
    pub tag: String,
}

impl MemBank {
    /// 以字节计的容量，超出 `u64` 时饱和。
    #[inline]
    pub const fn size(&self) -> u64 {
        self.size_kb.saturating_mul(1024)
    }

    /// 归一化的存储类型。
    ///
    /// `bank0`..`bank3` 这样的编号存储区都是 DDR，其他标签去掉 `[...]` 后缀原样返回。
    pub fn memory_type(&self) -> &str {
        if self.tag.starts_with("bank") {
            "DDR"
        } else {
            match self.tag.find(['[', ']']) {
                Some(pos) => &self.tag[..pos],
                None => &self.tag,
            }
        }
    }
}

/// 存储拓扑快照。
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct Topology(Vec<MemBank>);

impl Topology {
    #[inline]
    pub fn new(banks: Vec<MemBank>) -> Self {
        Self(banks)
    }

    /// 只有一个已用存储区的拓扑，用于不导出拓扑文件的设备。
    pub fn single(size: u64, tag: &str) -> Self {
        Self(vec![MemBank {
            kind: MemKind::Ddr4,
            used: true,
            size_kb: size / 1024,
            base_address: 0,
            tag: tag.into(),
        }])
    }

    /// 从字节流解析拓扑，按声明的存储区数量确定读取长度，多余的尾部字节被忽略。
    pub fn parse(bytes: &[u8]) -> Result<Self, FormatError> {
        let Some(count) = bytes.get(..4) else {
            return Err(truncated(format!("{} bytes topology header", bytes.len())));
        };
        let count = i32::from_le_bytes([count[0], count[1], count[2], count[3]]);
        let Ok(count) = usize::try_from(count) else {
            return Err(bad_field(format!("negative bank count {count}")));
        };
        if count == 0 {
            return Ok(Self::default());
        }

        let len = count
            .checked_mul(RECORD)
            .and_then(|n| n.checked_add(HEADER))
            .ok_or_else(|| bad_field(format!("bank count {count} overflows")))?;
        let Some(body) = bytes.get(HEADER..len) else {
            return Err(truncated(format!(
                "{count} banks need {len} bytes, {} given",
                bytes.len()
            )));
        };

        let banks = body
            .chunks_exact(RECORD)
            .enumerate()
            .map(|(n, record)| {
                let u64_at = |i: usize| {
                    let mut buf = [0; 8];
                    buf.copy_from_slice(&record[i..][..8]);
                    u64::from_le_bytes(buf)
                };
                let size_kb = u64_at(8);
                if size_kb > MAX_SIZE_KB {
                    return Err(bad_field(format!("bank {n} size {size_kb} KiB overflows")));
                }
                let tag = &record[24..][..TAG];
                let end = tag.iter().position(|&b| b == 0).unwrap_or(TAG);
                Ok(MemBank {
                    kind: record[0].into(),
                    used: record[1] != 0,
                    size_kb,
                    base_address: u64_at(16),
                    tag: String::from_utf8_lossy(&tag[..end]).into_owned(),
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self(banks))
    }

    /// 编码为与 [`parse`](Self::parse) 相同的布局，标签超过 16 字节的部分被截断。
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ans = vec![0u8; HEADER + self.0.len() * RECORD];
        ans[..4].copy_from_slice(&(self.0.len() as i32).to_le_bytes());
        for (bank, record) in self.0.iter().zip(ans[HEADER..].chunks_exact_mut(RECORD)) {
            record[0] = bank.kind.into();
            record[1] = bank.used as u8;
            record[8..16].copy_from_slice(&bank.size_kb.to_le_bytes());
            record[16..24].copy_from_slice(&bank.base_address.to_le_bytes());
            let tag = bank.tag.as_bytes();
            let len = tag.len().min(TAG);
            record[24..][..len].copy_from_slice(&tag[..len]);
        }
        ans
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn banks(&self) -> &[MemBank] {
        &self.0
    }

    #[inline]
    pub fn bank(&self, index: usize) -> Option<&MemBank> {
        self.0.get(index)
    }

    /// 只返回标记为已用的存储区。
    #[inline]
    pub fn used_bank(&self, index: usize) -> Option<&MemBank> {
        self.0.get(index).filter(|bank| bank.used)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::FormatErrorKind;
    use rand::Rng;

    fn bank(used: bool, size_kb: u64, tag: &str) -> MemBank {
        MemBank {
            kind: MemKind::Ddr4,
            used,
            size_kb,
            base_address: 0,
            tag: tag.into(),
        }
    }

    #[test]
    fn test_parse_banks() {
        let mut rng = rand::thread_rng();
        let tags = [
            "bank0", "bank1", "bank2", "bank3", "hbm[3]", "HBM[31]", "PLRAM[0]", "host",
        ];
        for n in [1, 4, 32, 128] {
            let banks = (0..n)
                .map(|i| {
                    bank(
                        rng.gen_bool(0.7),
                        rng.gen_range(1..1 << 24),
                        tags[i % tags.len()],
                    )
                })
                .collect::<Vec<_>>();
            let topology = Topology::parse(&Topology::new(banks.clone()).to_bytes()).unwrap();
            assert_eq!(topology.len(), n);
            for (i, expected) in banks.iter().enumerate() {
                let bank = topology.bank(i).unwrap();
                assert_eq!(bank.used, expected.used);
                assert_eq!(bank.size(), expected.size_kb * 1024);
                assert_eq!(bank.tag, expected.tag);
                assert_eq!(topology.used_bank(i).is_some(), expected.used);
            }
        }
    }

    #[test]
    fn test_memory_type() {
        for tag in ["bank0", "bank1", "bank2", "bank3"] {
            assert_eq!(bank(true, 1, tag).memory_type(), "DDR");
        }
        assert_eq!(bank(true, 1, "hbm[3]").memory_type(), "hbm");
        assert_eq!(bank(true, 1, "PLRAM[0]").memory_type(), "PLRAM");
        assert_eq!(bank(true, 1, "DDR").memory_type(), "DDR");
        assert_eq!(bank(true, 1, "streaming").memory_type(), "streaming");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Topology::parse(&[1, 0]).unwrap_err().kind,
            FormatErrorKind::Truncated
        );
        assert_eq!(
            Topology::parse(&(-1i32).to_le_bytes()).unwrap_err().kind,
            FormatErrorKind::BadField
        );

        let bytes = Topology::new(vec![bank(true, 4, "bank0"), bank(false, 4, "bank1")]).to_bytes();
        let e = Topology::parse(&bytes[..bytes.len() - 1]).unwrap_err();
        assert_eq!(e.kind, FormatErrorKind::Truncated);

        assert!(Topology::parse(&0i32.to_le_bytes()).unwrap().is_empty());
    }

    #[test]
    fn test_size_overflow() {
        let bytes = Topology::new(vec![bank(true, 4, "bank0"), bank(true, 1 << 60, "bank1")])
            .to_bytes();
        let e = Topology::parse(&bytes).unwrap_err();
        assert_eq!(e.kind, FormatErrorKind::BadField);

        let bytes = Topology::new(vec![bank(true, MAX_SIZE_KB, "bank0")]).to_bytes();
        let topology = Topology::parse(&bytes).unwrap();
        assert_eq!(topology.bank(0).unwrap().size(), MAX_SIZE_KB * 1024);

        assert_eq!(bank(true, 1 << 60, "bank0").size(), u64::MAX);
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = Topology::new(vec![bank(true, 16, "bank0")]).to_bytes();
        bytes.resize(4096, 0xff);
        let topology = Topology::parse(&bytes).unwrap();
        assert_eq!(topology.len(), 1);
        assert_eq!(topology.bank(0).unwrap().size(), 16 * 1024);
    }

    #[test]
    fn test_tag_fills_record() {
        let bytes = Topology::new(vec![bank(true, 1, "0123456789abcdefXYZ")]).to_bytes();
        let topology = Topology::parse(&bytes).unwrap();
        assert_eq!(topology.bank(0).unwrap().tag, "0123456789abcdef");
    }

    #[test]
    fn test_single() {
        let topology = Topology::single(8 << 30, "DDR");
        assert_eq!(topology.len(), 1);
        let bank = topology.used_bank(0).unwrap();
        assert_eq!(bank.size(), 8 << 30);
        assert_eq!(bank.memory_type(), "DDR");
        assert!(topology.used_bank(1).is_none());
    }
}
