//! 打包二进制（`xclbin2`）的文件头和分段表。
//!
//! 只解析运行时需要的部分：构建 UUID 和按类型查找分段。

use crate::{bad_field, bad_magic, truncated, FormatError};

const MAGIC: &[u8; 8] = b"xclbin2\0";
const UUID: usize = 416;
const NUM_SECTIONS: usize = 448;
const SECTIONS: usize = 456;
const SECTION_HEADER: usize = 40;

/// 分段类型。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum SectionKind {
    Bitstream = 0,
    ClearingBitstream = 1,
    EmbeddedMetadata = 2,
    Firmware = 3,
    DebugData = 4,
    SchedFirmware = 5,
    MemTopology = 6,
    Connectivity = 7,
    IpLayout = 8,
}

/// 打包二进制的只读视图。
#[derive(Debug)]
pub struct Xclbin<'a> {
    bytes: &'a [u8],
    sections: Vec<(u32, usize, usize)>,
}

impl<'a> Xclbin<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FormatError> {
        if bytes.len() < SECTIONS {
            return Err(truncated(format!("{} bytes binary header", bytes.len())));
        }
        if &bytes[..MAGIC.len()] != MAGIC {
            return Err(bad_magic("not an xclbin2 binary"));
        }

        let count = u32_at(bytes, NUM_SECTIONS) as usize;
        let capacity = (bytes.len() - SECTIONS) / SECTION_HEADER;
        if count > capacity {
            return Err(truncated(format!("{count} section headers, room for {capacity}")));
        }
        let mut sections = Vec::with_capacity(count);
        for i in 0..count {
            let header = SECTIONS + i * SECTION_HEADER;
            let kind = u32_at(bytes, header);
            let offset = u64_at(bytes, header + 24);
            let size = u64_at(bytes, header + 32);
            match (usize::try_from(offset), usize::try_from(size)) {
                (Ok(offset), Ok(size))
                    if offset
                        .checked_add(size)
                        .is_some_and(|end| end <= bytes.len()) =>
                {
                    sections.push((kind, offset, size))
                }
                _ => {
                    return Err(bad_field(format!(
                        "section {i} [{offset}, +{size}) out of {} bytes",
                        bytes.len()
                    )))
                }
            }
        }
        Ok(Self { bytes, sections })
    }

    /// 构建 UUID，用于区分不同的构建产物。
    pub fn uuid(&self) -> [u8; 16] {
        let mut ans = [0; 16];
        ans.copy_from_slice(&self.bytes[UUID..][..16]);
        ans
    }

    /// 以小写十六进制表示的构建 UUID。
    pub fn uuid_string(&self) -> String {
        self.uuid().iter().map(|b| format!("{b:02x}")).collect()
    }

    /// 第一个指定类型的分段。
    pub fn section(&self, kind: SectionKind) -> Option<&'a [u8]> {
        self.sections
            .iter()
            .find(|(k, _, _)| *k == kind as u32)
            .map(|&(_, offset, size)| &self.bytes[offset..][..size])
    }

    #[inline]
    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }
}

#[inline]
fn u32_at(bytes: &[u8], i: usize) -> u32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(&bytes[i..][..4]);
    u32::from_le_bytes(buf)
}

#[inline]
fn u64_at(bytes: &[u8], i: usize) -> u64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(&bytes[i..][..8]);
    u64::from_le_bytes(buf)
}

/// 构造一个只含给定分段的打包二进制，供测试和仿真设备使用。
pub fn build(uuid: [u8; 16], sections: &[(SectionKind, &[u8])]) -> Vec<u8> {
    let data = SECTIONS + sections.len() * SECTION_HEADER;
    let mut ans = vec![0u8; data];
    ans[..MAGIC.len()].copy_from_slice(MAGIC);
    ans[UUID..][..16].copy_from_slice(&uuid);
    ans[NUM_SECTIONS..][..4].copy_from_slice(&(sections.len() as u32).to_le_bytes());
    for (i, (kind, payload)) in sections.iter().enumerate() {
        let offset = ans.len();
        ans.extend_from_slice(payload);
        while ans.len() % 8 != 0 {
            ans.push(0)
        }
        let header = SECTIONS + i * SECTION_HEADER;
        ans[header..][..4].copy_from_slice(&(*kind as u32).to_le_bytes());
        ans[header + 24..][..8].copy_from_slice(&(offset as u64).to_le_bytes());
        ans[header + 32..][..8].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    }
    let len = ans.len() as u64;
    ans[304..][..8].copy_from_slice(&len.to_le_bytes());
    ans
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{FormatErrorKind, MemBank, MemKind, Topology};

    #[test]
    fn test_mem_topology_section() {
        let topology = Topology::new(vec![
            MemBank {
                kind: MemKind::Ddr4,
                used: true,
                size_kb: 16 << 20,
                base_address: 0x40_0000_0000,
                tag: "bank0".into(),
            },
            MemBank {
                kind: MemKind::Streaming,
                used: false,
                size_kb: 0,
                base_address: 0,
                tag: "streaming".into(),
            },
        ]);
        let topo = topology.to_bytes();
        let uuid = *b"0123456789abcdef";
        let bin = build(
            uuid,
            &[
                (SectionKind::Bitstream, &[7u8; 13][..]),
                (SectionKind::MemTopology, &topo[..]),
            ],
        );

        let xclbin = Xclbin::parse(&bin).unwrap();
        assert_eq!(xclbin.num_sections(), 2);
        assert_eq!(xclbin.uuid(), uuid);
        assert_eq!(xclbin.uuid_string(), "30313233343536373839616263646566");
        assert_eq!(xclbin.section(SectionKind::Bitstream).unwrap(), &[7u8; 13]);
        let parsed = Topology::parse(xclbin.section(SectionKind::MemTopology).unwrap()).unwrap();
        assert_eq!(parsed, topology);
        assert!(xclbin.section(SectionKind::IpLayout).is_none());
    }

    #[test]
    fn test_bad_binary() {
        assert_eq!(
            Xclbin::parse(&[0; 16]).unwrap_err().kind,
            FormatErrorKind::Truncated
        );
        assert_eq!(
            Xclbin::parse(&[0; 1024]).unwrap_err().kind,
            FormatErrorKind::BadMagic
        );

        let mut bin = build([0; 16], &[(SectionKind::MemTopology, &[1u8; 8][..])]);
        let size = SECTIONS + 32;
        bin[size..][..8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert_eq!(
            Xclbin::parse(&bin).unwrap_err().kind,
            FormatErrorKind::BadField
        );
    }

    #[test]
    fn test_section_count_overflow() {
        let mut bin = build([1; 16], &[]);
        bin[NUM_SECTIONS..][..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(
            Xclbin::parse(&bin).unwrap_err().kind,
            FormatErrorKind::Truncated
        );

        let mut bin = build([1; 16], &[(SectionKind::Bitstream, &[0u8; 8][..])]);
        bin[NUM_SECTIONS..][..4].copy_from_slice(&3u32.to_le_bytes());
        assert_eq!(
            Xclbin::parse(&bin).unwrap_err().kind,
            FormatErrorKind::Truncated
        );
    }
}
