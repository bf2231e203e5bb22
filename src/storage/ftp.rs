use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use suppaftp::FtpStream;
use tracing::{debug, warn};

use crate::config::FtpSettings;
use crate::domain::Acl;
use crate::error::StudyError;
use crate::paths::{PathPolicy, PathResolver};
use crate::storage::FileManager;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpListing {
    pub name: String,
    pub is_dir: bool,
    pub mode: u32,
}

/// Minimal FTP control-session operations the file manager needs.
pub trait FtpControl: Send {
    fn make_dir(&mut self, path: &str) -> Result<(), StudyError>;
    fn remove_dir(&mut self, path: &str) -> Result<(), StudyError>;
    fn remove_file(&mut self, path: &str) -> Result<(), StudyError>;
    fn list(&mut self, path: &str) -> Result<Vec<FtpListing>, StudyError>;
    fn chmod(&mut self, path: &str, mode: u32) -> Result<(), StudyError>;
}

pub struct SuppaFtpControl {
    stream: FtpStream,
}

impl SuppaFtpControl {
    pub fn connect(settings: &FtpSettings) -> Result<Self, StudyError> {
        let mut stream = FtpStream::connect((settings.host.as_str(), settings.port))
            .map_err(|err| StudyError::Ftp(err.to_string()))?;
        stream
            .login(settings.user.as_str(), settings.password.as_str())
            .map_err(|err| StudyError::Ftp(err.to_string()))?;
        Ok(Self { stream })
    }
}

impl FtpControl for SuppaFtpControl {
    fn make_dir(&mut self, path: &str) -> Result<(), StudyError> {
        self.stream
            .mkdir(path)
            .map_err(|err| StudyError::Ftp(err.to_string()))
    }

    fn remove_dir(&mut self, path: &str) -> Result<(), StudyError> {
        self.stream
            .rmdir(path)
            .map_err(|err| StudyError::Ftp(err.to_string()))
    }

    fn remove_file(&mut self, path: &str) -> Result<(), StudyError> {
        self.stream
            .rm(path)
            .map_err(|err| StudyError::Ftp(err.to_string()))
    }

    fn list(&mut self, path: &str) -> Result<Vec<FtpListing>, StudyError> {
        let lines = self
            .stream
            .list(Some(path))
            .map_err(|err| StudyError::Ftp(err.to_string()))?;
        Ok(lines
            .iter()
            .filter_map(|line| parse_unix_listing(line))
            .collect())
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<(), StudyError> {
        self.stream
            .site(format!("CHMOD {mode:o} {path}"))
            .map(|_| ())
            .map_err(|err| StudyError::Ftp(err.to_string()))
    }
}

/// Parses one `ls -l` style line, e.g. `drwxrwx--- 2 ftp ftp 4096 Jan 01 10:00 name`.
pub fn parse_unix_listing(line: &str) -> Option<FtpListing> {
    let mut fields = line.split_whitespace();
    let perms = fields.next()?;
    if perms.len() < 10 {
        return None;
    }
    // links, owner, group, size, month, day, time-or-year
    let rest = fields.by_ref().skip(7).collect::<Vec<_>>();
    if rest.is_empty() {
        return None;
    }
    let name = rest.join(" ");
    if name == "." || name == ".." {
        return None;
    }
    Some(FtpListing {
        name,
        is_dir: perms.starts_with('d'),
        mode: mode_from_permission_string(&perms[1..10]),
    })
}

fn mode_from_permission_string(perms: &str) -> u32 {
    let bits = perms.as_bytes();
    let mut mode = 0u32;
    for (index, &ch) in bits.iter().enumerate().take(9) {
        let bit = 1 << (8 - index);
        match ch {
            b'r' | b'w' | b'x' => mode |= bit,
            b's' | b't' => {
                mode |= bit;
                mode |= special_bit(index);
            }
            b'S' | b'T' => mode |= special_bit(index),
            _ => {}
        }
    }
    mode
}

fn special_bit(index: usize) -> u32 {
    match index {
        2 => 0o4000,
        5 => 0o2000,
        8 => 0o1000,
        _ => 0,
    }
}

/// File manager dispatched over an FTP control session.
pub struct FtpFileManager {
    resolver: PathResolver,
    host: String,
    session: Mutex<Box<dyn FtpControl>>,
}

impl FtpFileManager {
    pub fn new(root: impl Into<Utf8PathBuf>, host: &str, session: Box<dyn FtpControl>) -> Self {
        Self {
            resolver: PathResolver::with_policy(root, PathPolicy::AllowLeadingDot),
            host: host.to_string(),
            session: Mutex::new(session),
        }
    }

    pub fn connect(root: impl Into<Utf8PathBuf>, settings: &FtpSettings) -> Result<Self, StudyError> {
        let control = SuppaFtpControl::connect(settings)?;
        Ok(Self::new(root, &settings.host, Box::new(control)))
    }

    fn with_session<T>(&self, op: impl FnOnce(&mut dyn FtpControl) -> T) -> T {
        let mut guard = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        op(guard.as_mut())
    }

    fn lookup(session: &mut dyn FtpControl, path: &Utf8Path) -> Option<FtpListing> {
        let parent = path.parent()?;
        let name = path.file_name()?;
        session
            .list(parent.as_str())
            .ok()?
            .into_iter()
            .find(|entry| entry.name == name)
    }

    fn remove_tree(session: &mut dyn FtpControl, path: &Utf8Path) -> Result<(), StudyError> {
        for entry in session.list(path.as_str())? {
            let child = path.join(&entry.name);
            if entry.is_dir {
                Self::remove_tree(session, &child)?;
            } else {
                session.remove_file(child.as_str())?;
            }
        }
        session.remove_dir(path.as_str())
    }
}

impl FileManager for FtpFileManager {
    fn create_folder(
        &self,
        paths: &[&str],
        acl: Acl,
        exist_ok: bool,
    ) -> Result<bool, StudyError> {
        let resolved = paths
            .iter()
            .map(|path| self.resolver.absolute(path))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.with_session(|session| {
            for path in &resolved {
                match Self::lookup(session, path) {
                    Some(existing) if !exist_ok || !existing.is_dir => return false,
                    Some(_) => {}
                    None => {
                        if let Err(err) = session.make_dir(path.as_str()) {
                            warn!(path = %path, error = %err, "ftp mkdir failed");
                            return false;
                        }
                    }
                }
                if session.chmod(path.as_str(), acl.mode()).is_err() {
                    return false;
                }
            }
            true
        }))
    }

    fn delete_folder(&self, path: &str) -> Result<bool, StudyError> {
        let path = self.resolver.absolute(path)?;
        Ok(self.with_session(|session| match Self::lookup(session, &path) {
            None => true,
            Some(entry) if !entry.is_dir => false,
            Some(_) => match Self::remove_tree(session, &path) {
                Ok(()) => true,
                Err(err) => {
                    debug!(path = %path, error = %err, "ftp delete failed");
                    false
                }
            },
        }))
    }

    fn does_folder_exist(&self, path: &str) -> Result<bool, StudyError> {
        let path = self.resolver.absolute(path)?;
        Ok(self.with_session(|session| {
            Self::lookup(session, &path)
                .map(|entry| entry.is_dir)
                .unwrap_or(false)
        }))
    }

    fn get_folder_permission(&self, path: &str) -> Result<Acl, StudyError> {
        let path = self.resolver.absolute(path)?;
        Ok(self.with_session(|session| {
            Self::lookup(session, &path)
                .filter(|entry| entry.is_dir)
                .map(|entry| Acl::from_mode(entry.mode))
                .unwrap_or(Acl::Unknown)
        }))
    }

    fn update_folder_permission(&self, path: &str, acl: Acl) -> Result<bool, StudyError> {
        let path = self.resolver.absolute(path)?;
        Ok(self.with_session(|session| session.chmod(path.as_str(), acl.mode()).is_ok()))
    }

    fn is_file(&self, path: &str) -> Result<bool, StudyError> {
        let path = self.resolver.absolute(path)?;
        Ok(self.with_session(|session| {
            Self::lookup(session, &path)
                .map(|entry| !entry.is_dir)
                .unwrap_or(false)
        }))
    }

    fn is_folder(&self, path: &str) -> Result<bool, StudyError> {
        self.does_folder_exist(path)
    }

    fn get_uri(&self, path: &str) -> Result<String, StudyError> {
        let path = self.resolver.absolute(path)?;
        Ok(format!("ftp://{}{}", self.host, path))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// In-memory FTP server: path -> (is_dir, mode).
    #[derive(Clone, Default)]
    struct FakeFtp {
        entries: Arc<Mutex<BTreeMap<String, (bool, u32)>>>,
    }

    impl FakeFtp {
        fn with_root(root: &str) -> Self {
            let fake = Self::default();
            fake.entries
                .lock()
                .unwrap()
                .insert(root.to_string(), (true, 0o755));
            fake
        }
    }

    impl FtpControl for FakeFtp {
        fn make_dir(&mut self, path: &str) -> Result<(), StudyError> {
            let mut entries = self.entries.lock().unwrap();
            let parent = Utf8Path::new(path).parent().unwrap().to_string();
            if !entries.contains_key(&parent) {
                return Err(StudyError::Ftp(format!("550 {parent}")));
            }
            entries.insert(path.to_string(), (true, 0o755));
            Ok(())
        }

        fn remove_dir(&mut self, path: &str) -> Result<(), StudyError> {
            self.entries.lock().unwrap().remove(path);
            Ok(())
        }

        fn remove_file(&mut self, path: &str) -> Result<(), StudyError> {
            self.entries.lock().unwrap().remove(path);
            Ok(())
        }

        fn list(&mut self, path: &str) -> Result<Vec<FtpListing>, StudyError> {
            let entries = self.entries.lock().unwrap();
            Ok(entries
                .iter()
                .filter(|(key, _)| {
                    Utf8Path::new(key.as_str()).parent().map(|p| p.as_str()) == Some(path)
                })
                .map(|(key, (is_dir, mode))| FtpListing {
                    name: Utf8Path::new(key).file_name().unwrap().to_string(),
                    is_dir: *is_dir,
                    mode: *mode,
                })
                .collect())
        }

        fn chmod(&mut self, path: &str, mode: u32) -> Result<(), StudyError> {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(path) {
                Some(entry) => {
                    entry.1 = mode;
                    Ok(())
                }
                None => Err(StudyError::Ftp(format!("550 {path}"))),
            }
        }
    }

    #[test]
    fn parse_listing_line() {
        let entry =
            parse_unix_listing("drwxrws--- 2 ftp ftp 4096 Jan 01 10:00 mtbls1-abc").unwrap();
        assert!(entry.is_dir);
        assert_eq!(entry.mode, 0o2770);
        assert_eq!(entry.name, "mtbls1-abc");
        let file = parse_unix_listing("-rw-r--r-- 1 ftp ftp 12 Jan 01 2024 my file.txt").unwrap();
        assert!(!file.is_dir);
        assert_eq!(file.mode, 0o644);
        assert_eq!(file.name, "my file.txt");
        assert!(parse_unix_listing("total 8").is_none());
    }

    #[test]
    fn create_and_inspect_folders_over_session() {
        let fake = FakeFtp::with_root("/private");
        let manager = FtpFileManager::new("/private", "ftp.example.org", Box::new(fake.clone()));
        assert!(manager
            .create_folder(
                &["mtbls1-abc", "./mtbls1-abc/RAW_FILES"],
                Acl::AuthorizedReadWrite,
                true
            )
            .unwrap());
        assert!(manager.does_folder_exist("mtbls1-abc").unwrap());
        assert_eq!(
            manager.get_folder_permission("mtbls1-abc/RAW_FILES").unwrap(),
            Acl::AuthorizedReadWrite
        );
        assert!(!manager
            .create_folder(&["mtbls1-abc"], Acl::ReadOnly, false)
            .unwrap());
        assert!(manager.delete_folder("mtbls1-abc").unwrap());
        assert!(!manager.does_folder_exist("mtbls1-abc").unwrap());
        assert_eq!(
            manager.get_uri("x").unwrap(),
            "ftp://ftp.example.org/private/x"
        );
    }
}
