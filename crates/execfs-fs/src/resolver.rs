//! Virtual path resolution.
//!
//! A virtual file name may carry an invocation suffix:
//!
//! ```text
//! report                 run `report` with no arguments
//! report?                same, with an explicitly empty argument list
//! report?daily&csv       run `report daily csv`
//! report??daily          run `report daily` with stdin at end-of-file
//! grep?a%26b&notes.txt   run `grep 'a&b' notes.txt`
//! ```
//!
//! `?` starts the suffix and `&` separates arguments. Inside an argument,
//! `%`, `&`, `?` and `/` must be written as `%XX` escapes. Backing entries
//! whose name contains `?` are never exposed.

use crate::attr::NodeKind;
use crate::error::Fault;
use execfs_runtime::StdinSource;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Starts the invocation suffix of a virtual name.
pub const INVOCATION_DELIMITER: u8 = b'?';

/// Separates arguments inside the invocation suffix.
pub const ARGUMENT_SEPARATOR: u8 = b'&';

const ESCAPE: u8 = b'%';

/// Arguments and stdin selection encoded after the delimiter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub args: Vec<OsString>,
    /// `true` for the `??` form: stdin is closed regardless of open mode.
    pub null_stdin: bool,
}

/// One parsed path component: backing name plus optional invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualName {
    pub base: OsString,
    pub invocation: Option<Invocation>,
}

impl VirtualName {
    /// Split a virtual file name into its backing name and invocation.
    pub fn parse(name: &OsStr) -> Result<Self, Fault> {
        let bytes = name.as_bytes();
        let Some(pos) = bytes.iter().position(|&b| b == INVOCATION_DELIMITER) else {
            return Ok(Self {
                base: name.to_os_string(),
                invocation: None,
            });
        };

        let base = &bytes[..pos];
        if base.is_empty() {
            return Err(Fault::InvalidArgument("empty program name".to_string()));
        }

        let mut query = &bytes[pos + 1..];
        let null_stdin = match query.first() {
            Some(&INVOCATION_DELIMITER) => {
                query = &query[1..];
                true
            }
            _ => false,
        };

        let args = if query.is_empty() {
            Vec::new()
        } else {
            query
                .split(|&b| b == ARGUMENT_SEPARATOR)
                .map(decode_argument)
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Self {
            base: OsString::from_vec(base.to_vec()),
            invocation: Some(Invocation { args, null_stdin }),
        })
    }

    /// Re-encode into a name that parses back to `self`.
    pub fn encode(&self) -> OsString {
        let mut out = self.base.as_bytes().to_vec();
        if let Some(invocation) = &self.invocation {
            out.push(INVOCATION_DELIMITER);
            if invocation.null_stdin {
                out.push(INVOCATION_DELIMITER);
            }
            for (i, arg) in invocation.args.iter().enumerate() {
                if i > 0 {
                    out.push(ARGUMENT_SEPARATOR);
                }
                encode_argument(arg.as_bytes(), &mut out);
            }
        }
        OsString::from_vec(out)
    }
}

fn decode_argument(raw: &[u8]) -> Result<OsString, Fault> {
    if raw.is_empty() {
        return Err(Fault::InvalidArgument("empty argument".to_string()));
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            ESCAPE => {
                let byte = raw
                    .get(i + 1..i + 3)
                    .filter(|hex| hex.iter().all(u8::is_ascii_hexdigit))
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                    .ok_or_else(|| {
                        Fault::InvalidArgument(format!(
                            "malformed escape in {:?}",
                            String::from_utf8_lossy(raw)
                        ))
                    })?;
                if byte == 0 {
                    return Err(Fault::InvalidArgument("NUL in argument".to_string()));
                }
                out.push(byte);
                i += 3;
            }
            INVOCATION_DELIMITER => {
                return Err(Fault::InvalidArgument(
                    "unescaped '?' in argument".to_string(),
                ));
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(OsString::from_vec(out))
}

fn encode_argument(arg: &[u8], out: &mut Vec<u8>) {
    for &b in arg {
        match b {
            ESCAPE | ARGUMENT_SEPARATOR | INVOCATION_DELIMITER | b'/' => {
                out.extend_from_slice(format!("%{:02X}", b).as_bytes());
            }
            _ => out.push(b),
        }
    }
}

/// A resolved exec-on-open file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualPath {
    /// Path relative to the mount root, without the invocation suffix.
    pub relative: PathBuf,
    /// Absolute path of the backing executable.
    pub backing: PathBuf,
    /// Arguments from the invocation suffix, if one was given.
    pub args: Option<Vec<OsString>>,
    /// Stdin source forced by the name; `None` leaves it to the open mode.
    pub stdin: Option<StdinSource>,
}

/// What a virtual path refers to in the backing tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Directory(PathBuf),
    Executable(VirtualPath),
    /// A regular file without execute permission: visible, never run.
    Plain(PathBuf),
}

impl Target {
    pub fn backing(&self) -> &Path {
        match self {
            Target::Directory(path) | Target::Plain(path) => path,
            Target::Executable(vpath) => &vpath.backing,
        }
    }
}

/// Directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: NodeKind,
}

/// Maps virtual paths onto a backing directory tree.
#[derive(Debug, Clone)]
pub struct Resolver {
    root: PathBuf,
    hide_non_executable: bool,
}

impl Resolver {
    pub fn new(root: impl Into<PathBuf>, hide_non_executable: bool) -> Self {
        Self {
            root: root.into(),
            hide_non_executable,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a virtual path, relative to the mount root or starting with `/`.
    ///
    /// # Errors
    ///
    /// - [`Fault::PermissionDenied`] for `..` segments
    /// - [`Fault::InvalidArgument`] for a malformed invocation suffix
    /// - [`Fault::NotFound`] if nothing exposable exists at the path
    pub fn resolve(&self, path: &Path) -> Result<Target, Fault> {
        let components = split_components(path)?;

        let Some((last, parents)) = components.split_last() else {
            return Ok(Target::Directory(self.root.clone()));
        };

        let mut backing = self.root.clone();
        let mut relative = PathBuf::new();
        for component in parents {
            if is_reserved(component) {
                return Err(Fault::NotFound);
            }
            backing.push(component);
            relative.push(component);
        }

        let name = VirtualName::parse(last)?;
        backing.push(&name.base);
        relative.push(&name.base);

        let metadata = fs::metadata(&backing)?;
        if metadata.is_dir() {
            return match name.invocation {
                None => Ok(Target::Directory(backing)),
                Some(_) => Err(Fault::NotFound),
            };
        }
        if !metadata.is_file() {
            return Err(Fault::NotFound);
        }

        if is_executable(metadata.permissions().mode()) {
            let (args, stdin) = match name.invocation {
                Some(invocation) => (
                    Some(invocation.args),
                    invocation.null_stdin.then_some(StdinSource::Null),
                ),
                None => (None, None),
            };
            return Ok(Target::Executable(VirtualPath {
                relative,
                backing,
                args,
                stdin,
            }));
        }

        if self.hide_non_executable || name.invocation.is_some() {
            return Err(Fault::NotFound);
        }
        Ok(Target::Plain(backing))
    }

    /// List the exposed entries of a virtual directory, sorted by name.
    pub fn list(&self, path: &Path) -> Result<Vec<DirEntry>, Fault> {
        let dir = match self.resolve(path)? {
            Target::Directory(dir) => dir,
            _ => return Err(Fault::NotDirectory),
        };

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if is_reserved(&name) {
                continue;
            }

            // Follows symlinks; dangling ones are skipped like other
            // unexposable entries.
            let Ok(metadata) = fs::metadata(entry.path()) else {
                continue;
            };
            let kind = if metadata.is_dir() {
                NodeKind::Directory
            } else if metadata.is_file()
                && (!self.hide_non_executable || is_executable(metadata.permissions().mode()))
            {
                NodeKind::File
            } else {
                continue;
            };
            entries.push(DirEntry { name, kind });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// Whether any execute bit is set.
pub fn is_executable(mode: u32) -> bool {
    mode & 0o111 != 0
}

fn is_reserved(name: &OsStr) -> bool {
    name.as_bytes().contains(&INVOCATION_DELIMITER)
}

fn split_components(path: &Path) -> Result<Vec<&OsStr>, Fault> {
    let mut components = Vec::new();
    for raw in path.as_os_str().as_bytes().split(|&b| b == b'/') {
        match raw {
            b"" | b"." => {}
            b".." => {
                return Err(Fault::PermissionDenied(format!(
                    "{} escapes the backing root",
                    path.display()
                )));
            }
            _ => components.push(OsStr::from_bytes(raw)),
        }
    }
    Ok(components)
}
