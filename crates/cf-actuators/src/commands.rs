// commands.rs - commands promises: run a program once per run.
//
//   "/usr/bin/systemctl"
//       args    => "restart sshd",
//       timeout => "60";
//
// Exit status zero counts as repaired, anything else as not kept. Output is
// logged line by line at info level with a `Q:` prefix.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use cf_eval::{EvalContext, Promise, PromiseResult};

use crate::dispatch::{ActuatorEnv, Outcome, PromiseActuator};
use crate::timeout::{spawn_in_group, wait_with_timeout, WaitOutcome};

/// How long output readers get to finish once the child is gone.
const READER_GRACE: Duration = Duration::from_secs(1);

pub struct CommandsActuator;

fn drain<R: Read + Send + 'static>(reader: R, command: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            match line {
                Ok(line) => tracing::info!(command = %command, "Q: {}", line),
                Err(_) => break,
            }
        }
    })
}

/// Join the output readers, waiting until `deadline` at most. A reader
/// still blocked on a pipe that a detached descendant holds open is left
/// to finish on its own.
fn join_readers(readers: Vec<thread::JoinHandle<()>>, deadline: Instant, command: &str) {
    while readers.iter().any(|r| !r.is_finished()) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    for reader in readers {
        if !reader.is_finished() {
            tracing::debug!(command, "output still open after exit, detaching reader");
            continue;
        }
        if reader.join().is_err() {
            tracing::debug!(command, "output reader panicked");
        }
    }
}

/// Split an argument string on whitespace, keeping single- or double-quoted
/// runs together.
pub fn split_args(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_arg = true;
            }
            None if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            None => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if quote.is_some() {
        return Err(format!("unterminated quote in arguments: {}", line));
    }
    if in_arg {
        args.push(current);
    }
    Ok(args)
}

fn parse_timeout(promise: &Promise, ctx: &EvalContext, default: Duration) -> Result<Duration, String> {
    match promise.scalar("timeout") {
        Some(value) => {
            let value = ctx.expand_scalar(value);
            value
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| format!("invalid timeout '{}'", value))
        }
        None => Ok(default),
    }
}

impl PromiseActuator for CommandsActuator {
    fn promise_type(&self) -> &'static str {
        "commands"
    }

    fn one_shot(&self) -> bool {
        true
    }

    fn actuate(
        &mut self,
        env: &ActuatorEnv,
        ctx: &mut EvalContext,
        promise: &Promise,
        promiser: &str,
    ) -> Outcome {
        let limit = match parse_timeout(promise, ctx, env.command_timeout) {
            Ok(limit) => limit,
            Err(reason) => return Outcome::failed(reason),
        };
        let args = match promise.scalar("args").map(|args| split_args(&ctx.expand_scalar(args))) {
            Some(Ok(args)) => args,
            Some(Err(reason)) => return Outcome::failed(reason),
            None => Vec::new(),
        };

        tracing::info!(command = promiser, ?args, ?limit, "executing command");
        let mut command = Command::new(promiser);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match spawn_in_group(&mut command) {
            Ok(child) => child,
            Err(e) => return Outcome::failed(format!("could not start {}: {}", promiser, e)),
        };

        let readers: Vec<_> = [
            child.stdout.take().map(|out| drain(out, promiser.to_string())),
            child.stderr.take().map(|err| drain(err, promiser.to_string())),
        ]
        .into_iter()
        .flatten()
        .collect();

        let waited = wait_with_timeout(&mut child, limit);
        join_readers(readers, Instant::now() + READER_GRACE, promiser);

        match waited {
            Ok(WaitOutcome::Exited(status)) if status.success() => {
                Outcome::repaired(format!("{} succeeded", promiser))
            }
            Ok(WaitOutcome::Exited(status)) => Outcome::failed(format!("{} exited with {}", promiser, status)),
            Ok(WaitOutcome::TimedOut) => Outcome::new(
                PromiseResult::Timeout,
                format!("{} exceeded {}s and was terminated", promiser, limit.as_secs()),
            ),
            Err(e) => Outcome::failed(format!("waiting for {}: {}", promiser, e)),
        }
    }
}
