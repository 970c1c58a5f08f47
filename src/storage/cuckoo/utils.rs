use std::{
    fs,
    path::{Path, PathBuf},
};

use super::Error;

/// Name of the lock directory kept inside the database directory.
pub(super) const LOCKS_DIR: &str = "locks";

/// Prefix of the scratch files produced by a merge pass; leftovers are
/// deleted during recovery.
pub(super) const COMPACTION_PREFIX: &str = "compaction-";

/// Path of the data file with the given ID inside the database directory.
pub(super) fn datafile_name<P>(dir: P, fileid: u32) -> PathBuf
where
    P: AsRef<Path>,
{
    dir.as_ref().join(format!("{:08x}", fileid))
}

/// Parse a data file name back into its file ID.
pub(super) fn parse_fileid(name: &str) -> Option<u32> {
    if name.len() != 8 {
        return None;
    }
    u32::from_str_radix(name, 16).ok()
}

/// All regular files in `dir` whose names parse as data file IDs.
pub(super) fn datafile_ids<P>(dir: P) -> Result<Vec<(u32, PathBuf)>, Error>
where
    P: AsRef<Path>,
{
    let mut files = Vec::new();
    for dirent in fs::read_dir(&dir)? {
        let dirent = dirent?;
        if !dirent.file_type()?.is_file() {
            continue;
        }
        let name = dirent.file_name();
        if let Some(fileid) = name.to_str().and_then(parse_fileid) {
            files.push((fileid, dirent.path()));
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datafile_name_round_trip() {
        let path = datafile_name("/tmp/db", 0xbeef);
        assert_eq!(Path::new("/tmp/db/0000beef"), path.as_path());
        assert_eq!(Some(0xbeef), parse_fileid("0000beef"));
    }

    #[test]
    fn parse_fileid_rejects_foreign_names() {
        assert_eq!(None, parse_fileid(LOCKS_DIR));
        assert_eq!(None, parse_fileid("compaction-00000001"));
        assert_eq!(None, parse_fileid("1234567"));
        assert_eq!(None, parse_fileid("123456789"));
        assert_eq!(None, parse_fileid("0000zzzz"));
    }

    #[test]
    fn datafile_ids_skips_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(datafile_name(dir.path(), 1), b"a").unwrap();
        fs::write(datafile_name(dir.path(), 0x20), b"b").unwrap();
        fs::write(dir.path().join("compaction-00000001"), b"c").unwrap();
        fs::create_dir(dir.path().join(LOCKS_DIR)).unwrap();

        let mut files = datafile_ids(dir.path()).unwrap();
        files.sort_by_key(|(fileid, _)| *fileid);
        let ids: Vec<u32> = files.iter().map(|(fileid, _)| *fileid).collect();
        assert_eq!(vec![1, 0x20], ids);
    }
}
