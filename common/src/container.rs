//! 顺序打包多个二进制的容器，布局与 tar 相同：
//!
//! - 每个成员以一个 512 字节的头块开始，偏移 0 处是以 NUL 结尾的成员名，
//!   偏移 124 处是 11 个字符的八进制成员大小；
//! - 成员内容从头块之后开始，填充到下一个 512 字节边界；
//! - 全零的头块表示容器结束。

use crate::{bad_field, truncated, FormatError};

pub const BLOCK: usize = 512;

const NAME: usize = 100;
const SIZE: usize = 124;
const SIZE_LEN: usize = 12;

/// 容器中的一个成员。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Member<'a> {
    pub name: &'a str,
    /// 头块在容器中的偏移。
    pub offset: usize,
    pub data: &'a [u8],
}

impl Member<'_> {
    /// 下一个成员头块的偏移。
    #[inline]
    pub fn next_offset(&self) -> usize {
        next_offset(self.offset, self.data.len())
    }

    /// 去掉扩展名的成员名。
    pub fn stem(&self) -> &str {
        let base = self.name.rsplit('/').next().unwrap_or(self.name);
        match base.rfind('.') {
            Some(0) | None => base,
            Some(pos) => &base[..pos],
        }
    }
}

/// 位于 `offset` 处、内容长 `size` 的成员之后的下一个头块偏移。
#[inline]
pub const fn next_offset(offset: usize, size: usize) -> usize {
    offset + BLOCK + size.div_ceil(BLOCK) * BLOCK
}

/// 解析以 NUL 或空格结尾的八进制字段。
pub fn parse_octal(field: &[u8]) -> Result<usize, FormatError> {
    let end = field
        .iter()
        .position(|&b| b == 0 || b == b' ')
        .unwrap_or(field.len());
    let digits = &field[..end];
    if digits.is_empty() {
        return Err(bad_field("empty octal field"));
    }
    digits.iter().try_fold(0usize, |acc, &b| match b {
        b'0'..=b'7' => acc
            .checked_mul(8)
            .map(|acc| acc + (b - b'0') as usize)
            .ok_or_else(|| bad_field("octal field overflows")),
        _ => Err(bad_field(format!(
            "\"{}\" is not octal",
            String::from_utf8_lossy(digits)
        ))),
    })
}

/// 容器成员迭代器。
pub struct Container<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> Container<'a> {
    #[inline]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    /// 一次解析出全部成员，任何成员格式错误都使整个容器无效。
    pub fn members(bytes: &'a [u8]) -> Result<Vec<Member<'a>>, FormatError> {
        Self::new(bytes).collect()
    }

    fn member_at(&self, offset: usize) -> Result<Option<Member<'a>>, FormatError> {
        if offset >= self.bytes.len() {
            return Ok(None);
        }
        let Some(header) = self.bytes.get(offset..offset + BLOCK) else {
            return Err(truncated(format!("header block at {offset}")));
        };
        if header[0] == 0 {
            return Ok(None);
        }

        let name = &header[..NAME];
        let name = &name[..name.iter().position(|&b| b == 0).unwrap_or(NAME)];
        let Ok(name) = std::str::from_utf8(name) else {
            return Err(bad_field(format!("member name at {offset} is not utf-8")));
        };
        let size = parse_octal(&header[SIZE..][..SIZE_LEN])?;
        let start = offset + BLOCK;
        let Some(data) = self.bytes.get(start..).and_then(|rest| rest.get(..size)) else {
            return Err(truncated(format!(
                "member \"{name}\" needs {size} bytes at {start}, container has {}",
                self.bytes.len()
            )));
        };
        Ok(Some(Member { name, offset, data }))
    }
}

impl<'a> Iterator for Container<'a> {
    type Item = Result<Member<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.member_at(self.cursor) {
            Ok(Some(member)) => {
                self.cursor = member.next_offset();
                Some(Ok(member))
            }
            Ok(None) => None,
            Err(e) => {
                self.cursor = usize::MAX;
                Some(Err(e))
            }
        }
    }
}

/// 把成员打包成容器，末尾追加两个全零块。
pub fn pack(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut ans = Vec::new();
    for (name, data) in members {
        let mut header = [0u8; BLOCK];
        let len = name.len().min(NAME - 1);
        header[..len].copy_from_slice(&name.as_bytes()[..len]);
        header[100..108].copy_from_slice(b"0000644\0");
        let size = format!("{:011o}\0", data.len());
        header[SIZE..][..SIZE_LEN].copy_from_slice(size.as_bytes());
        header[156] = b'0';
        header[257..263].copy_from_slice(b"ustar\0");

        ans.extend_from_slice(&header);
        ans.extend_from_slice(data);
        ans.resize(ans.len().div_ceil(BLOCK) * BLOCK, 0);
    }
    ans.resize(ans.len() + 2 * BLOCK, 0);
    ans
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::FormatErrorKind;

    #[test]
    fn test_two_members() {
        let a = [0xa5u8; 64];
        let b = (0..600).map(|i| i as u8).collect::<Vec<_>>();
        let bytes = pack(&[("a", &a[..]), ("b", &b[..])]);

        let members = Container::members(&bytes).unwrap();
        assert_eq!(members.len(), 2);

        let [ma, mb] = [members[0], members[1]];
        assert_eq!(ma.name, "a");
        assert_eq!(ma.offset, 0);
        assert_eq!(ma.data, &a);
        assert_eq!(ma.next_offset(), 1024);
        assert_eq!(ma.next_offset() % BLOCK, 0);

        assert_eq!(mb.name, "b");
        assert_eq!(mb.offset, 1024);
        assert_eq!(mb.data.len(), 600);
        assert_eq!(mb.data, &b[..]);
        assert_eq!(mb.next_offset(), 1024 + 512 + 1024);
    }

    #[test]
    fn test_next_offset() {
        assert_eq!(next_offset(0, 0), 512);
        assert_eq!(next_offset(0, 1), 1024);
        assert_eq!(next_offset(0, 512), 1024);
        assert_eq!(next_offset(512, 513), 512 + 512 + 1024);
    }

    #[test]
    fn test_octal() {
        assert_eq!(parse_octal(b"00000001130\0").unwrap(), 600);
        assert_eq!(parse_octal(b"00000000100 ").unwrap(), 64);
        assert_eq!(parse_octal(b"777").unwrap(), 511);
        assert_eq!(
            parse_octal(b"0000000009\0\0").unwrap_err().kind,
            FormatErrorKind::BadField
        );
        assert_eq!(parse_octal(b"\0").unwrap_err().kind, FormatErrorKind::BadField);
    }

    #[test]
    fn test_truncated() {
        let b = [1u8; 600];
        let bytes = pack(&[("b", &b[..])]);
        let e = Container::members(&bytes[..700]).unwrap_err();
        assert_eq!(e.kind, FormatErrorKind::Truncated);

        let e = Container::members(&bytes[..100]).unwrap_err();
        assert_eq!(e.kind, FormatErrorKind::Truncated);

        let mut container = Container::new(&bytes[..700]);
        assert!(container.next().unwrap().is_err());
        assert!(container.next().is_none());
    }

    #[test]
    fn test_empty() {
        assert!(Container::members(&[]).unwrap().is_empty());
        assert!(Container::members(&[0; 1024]).unwrap().is_empty());
    }

    #[test]
    fn test_stem() {
        let empty: &[u8] = &[];
        let bytes = pack(&[("dir/vadd.xclbin", empty), ("plain", empty), (".hidden", empty)]);
        let stems = Container::new(&bytes)
            .map(|m| m.unwrap().stem().to_string())
            .collect::<Vec<_>>();
        assert_eq!(stems, ["vadd", "plain", ".hidden"]);
    }
}
