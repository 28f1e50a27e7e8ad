// files.rs - files promises: existence, permissions and copies.
//
//   "/etc/motd"
//       create    => "true",
//       perms     => { mode => "644" },
//       copy_from => { source => "/masterfiles/motd",
//                      servers => { "hub" }, port => "5308",
//                      compare => "digest", protocol_version => "classic" };
//
// Steps run in the order copy, create, perms. A failed step stops the rest.
// A copy with no servers (or only `localhost`) reads the local file system;
// otherwise each server is tried in turn through a cached connection until
// one answers. A directory source copies its regular files one level deep.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use cf_audit::hasher;
use cf_eval::{parse_bool, EvalContext, Promise, PromiseResult, Rval};
use cf_net::{parse_from_config, AgentConnection, ConnectionFlags, FileKind, NetError, ProtocolVersion};

use crate::dispatch::{ActuatorEnv, Outcome, PromiseActuator};

pub struct FilesActuator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    /// Copy when the SHA-256 digests differ.
    Digest,
    /// Copy only when the destination is missing.
    Exists,
}

#[derive(Debug, Clone)]
pub struct CopySpec {
    pub source: String,
    pub servers: Vec<String>,
    pub port: String,
    pub compare: Compare,
    pub protocol: ProtocolVersion,
    pub trust_server: bool,
}

impl CopySpec {
    pub fn from_body(
        ctx: &EvalContext,
        body: &BTreeMap<String, Rval>,
        env: &ActuatorEnv,
    ) -> Result<Self, String> {
        let scalar = |lval: &str| {
            body.get(lval)
                .and_then(Rval::as_scalar)
                .map(|v| ctx.expand_scalar(v))
        };

        let source = scalar("source").ok_or("copy_from without source")?;
        let servers = body
            .get("servers")
            .map(Rval::to_list)
            .unwrap_or_default()
            .iter()
            .map(|s| ctx.expand_scalar(s))
            .collect();
        let compare = match scalar("compare").as_deref() {
            None | Some("digest") | Some("hash") => Compare::Digest,
            Some("exists") => Compare::Exists,
            Some(other) => return Err(format!("unsupported compare method '{}'", other)),
        };
        let protocol = match scalar("protocol_version") {
            Some(setting) => {
                let parsed = parse_from_config(Some(&setting));
                if parsed.is_undefined() && setting != "undefined" && setting != "0" {
                    return Err(format!("unknown protocol_version '{}'", setting));
                }
                parsed
            }
            None => env.protocol,
        };
        let trust_server = scalar("trustkey")
            .map(|v| parse_bool(&v).unwrap_or(false))
            .unwrap_or(false);

        Ok(Self {
            source,
            servers,
            port: scalar("port").unwrap_or_else(|| env.default_port.clone()),
            compare,
            protocol,
            trust_server,
        })
    }

    fn is_local(&self) -> bool {
        self.servers.iter().all(|s| s == "localhost")
    }
}

/// What to do with one destination file.
enum Fetched {
    UpToDate,
    Content { data: Vec<u8>, mode: u32 },
}

fn local_digest_matches(dest: &Path, remote: impl FnOnce() -> Result<String, String>) -> Result<bool, String> {
    if !dest.is_file() {
        return Ok(false);
    }
    let local = hasher::hash_file(dest).map_err(|e| e.to_string())?;
    Ok(remote()? == local)
}

fn is_current(compare: Compare, dest: &Path, source_digest: impl FnOnce() -> Result<String, String>) -> Result<bool, String> {
    match compare {
        Compare::Exists => Ok(dest.exists()),
        Compare::Digest => local_digest_matches(dest, source_digest),
    }
}

/// Write `data` beside `dest` and rename it into place.
fn install(dest: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let staging = dest.with_file_name(format!(".{}.cf-new", name));
    fs::write(&staging, data)?;
    fs::set_permissions(&staging, fs::Permissions::from_mode(mode))?;
    fs::rename(&staging, dest)
}

fn apply(fetched: Vec<(PathBuf, Fetched)>, origin: &str) -> Outcome {
    let mut outcome = Outcome::kept();
    for (dest, item) in fetched {
        if let Fetched::Content { data, mode } = item {
            match install(&dest, &data, mode) {
                Ok(()) => {
                    outcome = outcome.merge(Outcome::repaired(format!(
                        "copied {} bytes to {} from {}",
                        data.len(),
                        dest.display(),
                        origin
                    )))
                }
                Err(e) => {
                    return outcome.merge(Outcome::failed(format!(
                        "could not install {}: {}",
                        dest.display(),
                        e
                    )))
                }
            }
        }
    }
    outcome
}

// -- local copies ------------------------------------------------------------

fn fetch_local_file(spec: &CopySpec, source: &Path, dest: &Path) -> Result<Fetched, String> {
    let source_digest = || hasher::hash_file(source).map_err(|e| e.to_string());
    if is_current(spec.compare, dest, source_digest)? {
        return Ok(Fetched::UpToDate);
    }
    let meta = fs::metadata(source).map_err(|e| format!("{}: {}", source.display(), e))?;
    let data = fs::read(source).map_err(|e| format!("{}: {}", source.display(), e))?;
    Ok(Fetched::Content {
        data,
        mode: meta.permissions().mode() & 0o7777,
    })
}

fn fetch_local(spec: &CopySpec, dest: &Path) -> Result<Vec<(PathBuf, Fetched)>, String> {
    let source = Path::new(&spec.source);
    let meta = fs::metadata(source).map_err(|e| format!("source {}: {}", spec.source, e))?;
    if meta.is_file() {
        return Ok(vec![(dest.to_path_buf(), fetch_local_file(spec, source, dest)?)]);
    }
    if !meta.is_dir() {
        return Err(format!("source {} is not a file or directory", spec.source));
    }

    let mut fetched = Vec::new();
    let entries = fs::read_dir(source).map_err(|e| format!("source {}: {}", spec.source, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| e.to_string())?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            let target = dest.join(entry.file_name());
            let item = fetch_local_file(spec, &entry.path(), &target)?;
            fetched.push((target, item));
        }
    }
    Ok(fetched)
}

// -- remote copies -----------------------------------------------------------

fn fetch_remote_file(
    conn: &mut AgentConnection,
    compare: Compare,
    source: &str,
    size: u64,
    mode: u32,
    dest: &Path,
) -> Result<Fetched, NetError> {
    let mut digest_error = None;
    let current = is_current(compare, dest, || {
        conn.digest(source).map_err(|e| {
            let text = e.to_string();
            digest_error = Some(e);
            text
        })
    });
    match current {
        Ok(true) => return Ok(Fetched::UpToDate),
        Ok(false) => {}
        Err(reason) => match digest_error {
            Some(e) => return Err(e),
            None => tracing::debug!(dest = %dest.display(), %reason, "local digest unavailable, copying"),
        },
    }

    let data = conn.get_file(source)?;
    if data.len() as u64 != size {
        return Err(NetError::Protocol {
            reason: format!("{} changed size during transfer ({} of {} bytes)", source, data.len(), size),
        });
    }
    Ok(Fetched::Content {
        data,
        mode: mode & 0o7777,
    })
}

fn fetch_remote(conn: &mut AgentConnection, spec: &CopySpec, dest: &Path) -> Result<Vec<(PathBuf, Fetched)>, NetError> {
    let stat = conn.stat(&spec.source)?;
    match stat.kind {
        FileKind::File => {
            let item = fetch_remote_file(conn, spec.compare, &spec.source, stat.size, stat.mode, dest)?;
            Ok(vec![(dest.to_path_buf(), item)])
        }
        FileKind::Directory => {
            let mut fetched = Vec::new();
            for name in conn.open_dir(&spec.source)? {
                if name == "." || name == ".." {
                    continue;
                }
                let child = format!("{}/{}", spec.source.trim_end_matches('/'), name);
                let child_stat = conn.stat(&child)?;
                if child_stat.kind != FileKind::File {
                    continue;
                }
                let target = dest.join(&name);
                let item = fetch_remote_file(conn, spec.compare, &child, child_stat.size, child_stat.mode, &target)?;
                fetched.push((target, item));
            }
            Ok(fetched)
        }
        other => Err(NetError::Rejected {
            reply: format!("{} is a {:?}, not a file or directory", spec.source, other),
        }),
    }
}

fn copy_remote(env: &ActuatorEnv, spec: &CopySpec, dest: &Path) -> Outcome {
    let flags = ConnectionFlags::new(spec.protocol).with_trust_server(spec.trust_server);
    let mut failures = Vec::new();

    for server in &spec.servers {
        let mut lease = match env.cache.acquire(server, &spec.port, flags, env.connector.as_ref()) {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(server = %server, port = %spec.port, error = %e, "server unavailable for copy");
                failures.push(format!("{}: {}", server, e));
                continue;
            }
        };
        match lease.with(|conn| fetch_remote(conn, spec, dest)) {
            Ok(fetched) => return apply(fetched, server),
            Err(NetError::Rejected { reply }) => {
                return Outcome::new(
                    PromiseResult::Denied,
                    format!("{} refused {}: {}", server, spec.source, reply),
                )
            }
            Err(e) => {
                tracing::warn!(server = %server, source = %spec.source, error = %e, "copy failed, trying next server");
                failures.push(format!("{}: {}", server, e));
            }
        }
    }

    Outcome::failed(format!(
        "no server could provide {} ({})",
        spec.source,
        failures.join("; ")
    ))
}

fn copy(env: &ActuatorEnv, spec: &CopySpec, dest: &Path) -> Outcome {
    if spec.is_local() {
        match fetch_local(spec, dest) {
            Ok(fetched) => apply(fetched, "localhost"),
            Err(reason) => Outcome::failed(reason),
        }
    } else {
        copy_remote(env, spec, dest)
    }
}

// -- create and perms --------------------------------------------------------

fn create_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map(|_| ())
}

fn ensure_exists(promiser: &str, path: &Path) -> Outcome {
    if path.exists() {
        return Outcome::kept();
    }
    let created = if promiser.ends_with('/') {
        fs::create_dir_all(path)
    } else {
        create_file(path)
    };
    match created {
        Ok(()) => Outcome::repaired(format!("created {}", promiser)),
        Err(e) => Outcome::failed(format!("could not create {}: {}", promiser, e)),
    }
}

fn ensure_mode(ctx: &EvalContext, perms: &BTreeMap<String, Rval>, path: &Path) -> Outcome {
    let wanted = match perms.get("mode").and_then(Rval::as_scalar) {
        Some(mode) => ctx.expand_scalar(mode),
        None => return Outcome::kept(),
    };
    let wanted = match u32::from_str_radix(wanted.trim_start_matches("0o"), 8) {
        Ok(mode) if mode <= 0o7777 => mode,
        _ => return Outcome::failed(format!("invalid mode '{}'", wanted)),
    };
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) => return Outcome::failed(format!("cannot set mode on {}: {}", path.display(), e)),
    };
    let current = meta.permissions().mode() & 0o7777;
    if current == wanted {
        return Outcome::kept();
    }
    match fs::set_permissions(path, fs::Permissions::from_mode(wanted)) {
        Ok(()) => Outcome::repaired(format!(
            "mode of {} changed from {:o} to {:o}",
            path.display(),
            current,
            wanted
        )),
        Err(e) => Outcome::failed(format!("could not chmod {}: {}", path.display(), e)),
    }
}

impl PromiseActuator for FilesActuator {
    fn promise_type(&self) -> &'static str {
        "files"
    }

    fn actuate(
        &mut self,
        env: &ActuatorEnv,
        ctx: &mut EvalContext,
        promise: &Promise,
        promiser: &str,
    ) -> Outcome {
        let path = PathBuf::from(promiser);
        let mut outcome = Outcome::kept();
        let mut acted = false;

        if let Some(body) = promise.body("copy_from") {
            acted = true;
            let spec = match CopySpec::from_body(ctx, body, env) {
                Ok(spec) => spec,
                Err(reason) => return Outcome::failed(reason),
            };
            outcome = outcome.merge(copy(env, &spec, &path));
            if outcome.result.is_failure() {
                return outcome;
            }
        }

        if promise.flag("create") == Some(true) {
            acted = true;
            outcome = outcome.merge(ensure_exists(promiser, &path));
            if outcome.result.is_failure() {
                return outcome;
            }
        }

        if let Some(perms) = promise.body("perms") {
            acted = true;
            outcome = outcome.merge(ensure_mode(ctx, perms, &path));
        }

        if !acted && !path.exists() {
            return Outcome::failed(format!("{} does not exist", promiser));
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_env;
    use cf_eval::Bundle;
    use tempfile::tempdir;

    fn body(pairs: &[(&str, Rval)]) -> Rval {
        Rval::Body(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    fn actuate(promise: Promise) -> Outcome {
        let mut ctx = EvalContext::new();
        let bundle = Bundle::new("main");
        let mut frame = ctx.push_bundle_frame(&bundle, &[], false);
        let mut frame = frame.push_promise_type_frame("files", 1);
        let promiser = frame.expand_scalar(&promise.promiser);
        FilesActuator.actuate(&test_env(), &mut frame, &promise, &promiser)
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[test]
    fn create_makes_file_then_keeps_it() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("sub").join("new.conf");
        let promise = Promise::new(target.to_str().unwrap()).with_attribute("create", "true");

        assert_eq!(actuate(promise.clone()).result, PromiseResult::Change);
        assert!(target.is_file());
        assert_eq!(actuate(promise).result, PromiseResult::Noop);
    }

    #[test]
    fn trailing_slash_creates_directory() {
        let dir = tempdir().unwrap();
        let target = format!("{}/made/", dir.path().display());
        let outcome = actuate(Promise::new(target.as_str()).with_attribute("create", "yes"));
        assert_eq!(outcome.result, PromiseResult::Change);
        assert!(Path::new(&target).is_dir());
    }

    #[test]
    fn perms_converge() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");
        fs::write(&target, b"x").unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o600)).unwrap();
        let promise = Promise::new(target.to_str().unwrap())
            .with_attribute("perms", body(&[("mode", Rval::from("640"))]));

        assert_eq!(actuate(promise.clone()).result, PromiseResult::Change);
        assert_eq!(mode_of(&target), 0o640);
        assert_eq!(actuate(promise).result, PromiseResult::Noop);
    }

    #[test]
    fn invalid_mode_fails() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");
        fs::write(&target, b"x").unwrap();
        let promise = Promise::new(target.to_str().unwrap())
            .with_attribute("perms", body(&[("mode", Rval::from("rwx"))]));
        assert_eq!(actuate(promise).result, PromiseResult::Fail);
    }

    #[test]
    fn local_copy_by_digest() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("master");
        let dest = dir.path().join("out").join("copy");
        fs::write(&source, b"version 1").unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o644)).unwrap();

        let promise = Promise::new(dest.to_str().unwrap())
            .with_attribute("copy_from", body(&[("source", Rval::from(source.to_str().unwrap()))]));
        assert_eq!(actuate(promise.clone()).result, PromiseResult::Change);
        assert_eq!(fs::read(&dest).unwrap(), b"version 1");
        assert_eq!(mode_of(&dest), 0o644);
        assert_eq!(actuate(promise.clone()).result, PromiseResult::Noop);

        fs::write(&source, b"version 2").unwrap();
        assert_eq!(actuate(promise).result, PromiseResult::Change);
        assert_eq!(fs::read(&dest).unwrap(), b"version 2");
    }

    #[test]
    fn exists_compare_never_overwrites() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("master");
        let dest = dir.path().join("copy");
        fs::write(&source, b"new").unwrap();
        fs::write(&dest, b"old").unwrap();

        let promise = Promise::new(dest.to_str().unwrap()).with_attribute(
            "copy_from",
            body(&[
                ("source", Rval::from(source.to_str().unwrap())),
                ("compare", Rval::from("exists")),
            ]),
        );
        assert_eq!(actuate(promise).result, PromiseResult::Noop);
        assert_eq!(fs::read(&dest).unwrap(), b"old");
    }

    #[test]
    fn local_directory_copy() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("masterfiles");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("a.cf"), b"a").unwrap();
        fs::write(source.join("b.cf"), b"b").unwrap();
        fs::create_dir(source.join("nested")).unwrap();
        let dest = dir.path().join("inputs");

        let promise = Promise::new(dest.to_str().unwrap())
            .with_attribute("copy_from", body(&[("source", Rval::from(source.to_str().unwrap()))]));
        assert_eq!(actuate(promise).result, PromiseResult::Change);
        assert_eq!(fs::read(dest.join("a.cf")).unwrap(), b"a");
        assert_eq!(fs::read(dest.join("b.cf")).unwrap(), b"b");
        assert!(!dest.join("nested").exists());
    }

    #[test]
    fn missing_source_fails_before_create() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("copy");
        let promise = Promise::new(dest.to_str().unwrap())
            .with_attribute("create", "true")
            .with_attribute("copy_from", body(&[("source", Rval::from("/nonexistent/cf-src"))]));
        assert_eq!(actuate(promise).result, PromiseResult::Fail);
        assert!(!dest.exists());
    }

    #[test]
    fn unreachable_servers_fail() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("copy");
        let promise = Promise::new(dest.to_str().unwrap()).with_attribute(
            "copy_from",
            body(&[
                ("source", Rval::from("/srv/file")),
                ("servers", Rval::from(vec!["hub-a".to_string(), "hub-b".to_string()])),
            ]),
        );
        let outcome = actuate(promise);
        assert_eq!(outcome.result, PromiseResult::Fail);
        let message = outcome.message.unwrap();
        assert!(message.contains("hub-a") && message.contains("hub-b"));
    }

    #[test]
    fn promise_without_steps_checks_existence() {
        assert_eq!(
            actuate(Promise::new("/nonexistent/cf-files-test")).result,
            PromiseResult::Fail
        );
        let dir = tempdir().unwrap();
        assert_eq!(
            actuate(Promise::new(dir.path().to_str().unwrap())).result,
            PromiseResult::Noop
        );
    }
}
