// handler.rs - FileServer: answers file requests for admitted paths.
//
// Requests are `VERB <path>`. The path is resolved (relative paths against
// the served root), canonicalized, and must land under an admitted prefix.
// Any `..` component is refused before touching the filesystem. Every
// refusal is a `BAD:` reply; the session stays open.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use cf_net::{
    FileKind, NetError, RemoteStat, RequestHandler, Session, TransactionStatus, MAX_BODY,
    TERMINATOR,
};

use crate::error::ServerError;

pub struct FileServer {
    root: PathBuf,
    admitted: Vec<PathBuf>,
    version: String,
}

fn rejected(reply: impl Into<String>) -> NetError {
    NetError::Rejected {
        reply: reply.into(),
    }
}

fn canonical(path: &Path) -> Result<PathBuf, ServerError> {
    path.canonicalize().map_err(|source| ServerError::BadRoot {
        path: path.to_path_buf(),
        source,
    })
}

impl FileServer {
    /// Serve `root`, admitting `admit` prefixes (or `root` when empty).
    pub fn new(root: &Path, admit: &[PathBuf]) -> Result<Self, ServerError> {
        let root = canonical(root)?;
        let admitted = if admit.is_empty() {
            vec![root.clone()]
        } else {
            admit.iter().map(|p| canonical(p)).collect::<Result<_, _>>()?
        };
        Ok(Self {
            root,
            admitted,
            version: format!("cf-serverd {}", env!("CARGO_PKG_VERSION")),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The local file a request path names, if it may be served.
    pub fn admit(&self, requested: &str) -> Result<PathBuf, NetError> {
        if requested.is_empty() {
            return Err(rejected("missing path"));
        }
        let path = Path::new(requested);
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(rejected(format!("path traversal refused: {}", requested)));
        }
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let resolved = full.canonicalize().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => rejected(format!("no such file: {}", requested)),
            _ => rejected(format!("cannot access {}", requested)),
        })?;
        if !self.admitted.iter().any(|prefix| resolved.starts_with(prefix)) {
            tracing::warn!(requested, resolved = %resolved.display(), "access outside admitted paths");
            return Err(rejected(format!("access denied: {}", requested)));
        }
        Ok(resolved)
    }

    fn stat(&self, session: &mut Session, path: &Path) -> Result<(), NetError> {
        let meta = fs::metadata(path).map_err(|e| rejected(format!("cannot stat: {}", e)))?;
        let kind = if meta.is_file() {
            FileKind::File
        } else if meta.is_dir() {
            FileKind::Directory
        } else {
            FileKind::Other
        };
        let stat = RemoteStat {
            kind,
            size: meta.len(),
            mode: meta.permissions().mode() & 0o7777,
            mtime: meta.mtime(),
        };
        session.send(stat.to_wire().as_bytes(), TransactionStatus::Done)
    }

    fn hash(&self, session: &mut Session, path: &Path) -> Result<(), NetError> {
        if !path.is_file() {
            return Err(rejected("not a regular file"));
        }
        let digest = cf_audit::hasher::hash_file(path)
            .map_err(|e| rejected(format!("cannot hash: {}", e)))?;
        session.reply_ok(&digest)
    }

    fn open_dir(&self, session: &mut Session, path: &Path) -> Result<(), NetError> {
        let entries = fs::read_dir(path).map_err(|e| rejected(format!("cannot open directory: {}", e)))?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names.push(TERMINATOR.to_string());

        // Names never straddle two transactions.
        let mut body: Vec<u8> = Vec::new();
        for name in &names {
            if !body.is_empty() && body.len() + name.len() + 1 > MAX_BODY {
                session.send(&body, TransactionStatus::More)?;
                body.clear();
            }
            body.extend_from_slice(name.as_bytes());
            body.push(0);
        }
        session.send(&body, TransactionStatus::Done)
    }

    fn get(&self, session: &mut Session, path: &Path) -> Result<(), NetError> {
        if !path.is_file() {
            return Err(rejected("not a regular file"));
        }
        let data = fs::read(path).map_err(|e| rejected(format!("cannot read: {}", e)))?;
        tracing::debug!(path = %path.display(), bytes = data.len(), "sending file");
        session.send_chunked(&data)
    }
}

impl RequestHandler for FileServer {
    fn handle(&self, session: &mut Session, request: &str) -> Result<(), NetError> {
        let (verb, arg) = request.split_once(' ').unwrap_or((request, ""));
        tracing::debug!(
            remote = %session.remote_addr(),
            user = %session.peer().username,
            verb,
            arg,
            "request"
        );
        match verb {
            "VERSION" => session.reply_ok(&self.version),
            "STAT" => {
                let path = self.admit(arg)?;
                self.stat(session, &path)
            }
            "HASH" => {
                let path = self.admit(arg)?;
                self.hash(session, &path)
            }
            "OPENDIR" => {
                let path = self.admit(arg)?;
                self.open_dir(session, &path)
            }
            "GET" => {
                let path = self.admit(arg)?;
                self.get(session, &path)
            }
            _ => Err(rejected(format!("unknown request {}", verb))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn relative_paths_resolve_under_root() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("motd"), "hi").unwrap();
        let server = FileServer::new(dir.path(), &[]).unwrap();
        let path = server.admit("motd").unwrap();
        assert_eq!(path, server.root().join("motd"));
        let absolute = server.root().join("motd");
        assert_eq!(server.admit(absolute.to_str().unwrap()).unwrap(), absolute);
    }

    #[test]
    fn traversal_is_refused() {
        let dir = tempdir().unwrap();
        let server = FileServer::new(dir.path(), &[]).unwrap();
        let err = server.admit("../etc/passwd").unwrap_err();
        assert!(matches!(err, NetError::Rejected { ref reply } if reply.contains("traversal")));
    }

    #[test]
    fn paths_outside_admitted_prefixes_are_denied() {
        let dir = tempdir().unwrap();
        let public = dir.path().join("public");
        let private = dir.path().join("private");
        fs::create_dir(&public).unwrap();
        fs::create_dir(&private).unwrap();
        fs::write(private.join("secret"), "x").unwrap();
        fs::write(public.join("open"), "y").unwrap();

        let server = FileServer::new(dir.path(), &[public.clone()]).unwrap();
        assert!(server.admit("public/open").is_ok());
        let err = server.admit("private/secret").unwrap_err();
        assert!(matches!(err, NetError::Rejected { ref reply } if reply.starts_with("access denied")));
    }

    #[test]
    fn symlink_escaping_root_is_denied() {
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("target"), "x").unwrap();
        let dir = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("target"), dir.path().join("link")).unwrap();

        let server = FileServer::new(dir.path(), &[]).unwrap();
        assert!(server.admit("link").is_err());
    }

    #[test]
    fn missing_file_is_rejected() {
        let dir = tempdir().unwrap();
        let server = FileServer::new(dir.path(), &[]).unwrap();
        let err = server.admit("nope").unwrap_err();
        assert!(matches!(err, NetError::Rejected { ref reply } if reply.starts_with("no such file")));
        assert!(server.admit("").is_err());
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            FileServer::new(&dir.path().join("absent"), &[]),
            Err(ServerError::BadRoot { .. })
        ));
    }
}
