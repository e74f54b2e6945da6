//! sysfs 风格文件树的查找和读取。

use glob::Pattern;
use log::trace;
use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
};

/// 在 `root` 下按相对模式查找所有匹配项，结果按路径排序。
pub(crate) fn all(root: &Path, pattern: &str) -> Vec<PathBuf> {
    let root = Pattern::escape(&root.to_string_lossy());
    let pattern = format!("{root}/{pattern}");
    match glob::glob(&pattern) {
        Ok(paths) => {
            let mut ans = paths.filter_map(Result::ok).collect::<Vec<_>>();
            ans.sort();
            ans
        }
        Err(e) => {
            trace!("bad pattern {pattern}: {e}");
            Vec::new()
        }
    }
}

/// 第一个匹配项。
#[inline]
pub(crate) fn first(root: &Path, pattern: &str) -> Option<PathBuf> {
    all(root, pattern).into_iter().next()
}

/// 读取文本文件中的第一个词。
pub(crate) fn read_word(path: &Path) -> io::Result<String> {
    let text = fs::read_to_string(path)?;
    match text.split_whitespace().next() {
        Some(word) => Ok(word.into()),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is empty", path.display()),
        )),
    }
}

/// 读取文本文件中的第一个词并解析。
pub(crate) fn read_value<T: FromStr>(path: &Path) -> io::Result<T> {
    let word = read_word(path)?;
    word.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} holds {word:?}", path.display()),
        )
    })
}

/// 读取文件开头至多 `limit` 字节的第一行。
pub(crate) fn read_line(path: &Path, limit: usize) -> io::Result<String> {
    let mut buf = Vec::with_capacity(limit);
    fs::File::open(path)?
        .take(limit as _)
        .read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);
    Ok(text.lines().next().unwrap_or("").trim().into())
}

/// 从文件 `offset` 处读取定长字节。
pub(crate) fn read_at<const N: usize>(path: &Path, offset: u64) -> io::Result<[u8; N]> {
    use std::io::{Seek, SeekFrom};

    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut ans = [0; N];
    file.read_exact(&mut ans)?;
    Ok(ans)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_glob_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("with [brackets]");
        for name in ["xmc.2", "xmc.1", "icap.0"] {
            fs::create_dir_all(root.join(name)).unwrap();
        }
        fs::write(root.join("xmc.1/serial_num"), "ABC123\n").unwrap();
        fs::write(root.join("xmc.1/xmc_power"), "  25000000 \n").unwrap();
        fs::write(root.join("xmc.1/blob"), [0, 1, 2, 3, 4, 5, 6, 7]).unwrap();
        fs::write(root.join("id"), "0123456789abcdef0123456789abcdefXYZ\n").unwrap();

        let xmc = all(&root, "xmc.*");
        assert_eq!(xmc, [root.join("xmc.1"), root.join("xmc.2")]);
        assert_eq!(first(&root, "icap.*"), Some(root.join("icap.0")));
        assert_eq!(first(&root, "nothing.*"), None);

        assert_eq!(read_word(&xmc[0].join("serial_num")).unwrap(), "ABC123");
        assert_eq!(read_value::<u64>(&xmc[0].join("xmc_power")).unwrap(), 25_000_000);
        assert!(read_value::<u64>(&xmc[0].join("serial_num")).is_err());
        assert!(read_word(&xmc[1].join("serial_num")).is_err());
        assert_eq!(read_at::<3>(&xmc[0].join("blob"), 4).unwrap(), [4, 5, 6]);
        assert!(read_at::<3>(&xmc[0].join("blob"), 6).is_err());
        assert_eq!(
            read_line(&root.join("id"), 32).unwrap(),
            "0123456789abcdef0123456789abcdef"
        );
    }
}
