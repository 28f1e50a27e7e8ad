// reports.rs - reports promises: print expanded text once per run.
//
// Output goes to the actuator's writer as `R: <text>` lines, or is appended
// to `report_to_file` when that attribute is set.

use std::fs::OpenOptions;
use std::io::{self, Write};

use cf_eval::{EvalContext, Promise};

use crate::dispatch::{ActuatorEnv, Outcome, PromiseActuator};

pub struct ReportsActuator {
    out: Box<dyn Write + Send>,
}

impl ReportsActuator {
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }
}

fn append_to_file(path: &str, text: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", text)
}

impl PromiseActuator for ReportsActuator {
    fn promise_type(&self) -> &'static str {
        "reports"
    }

    fn one_shot(&self) -> bool {
        true
    }

    fn actuate(
        &mut self,
        _env: &ActuatorEnv,
        ctx: &mut EvalContext,
        promise: &Promise,
        promiser: &str,
    ) -> Outcome {
        match promise.scalar("report_to_file") {
            Some(path) => {
                let path = ctx.expand_scalar(path);
                match append_to_file(&path, promiser) {
                    Ok(()) => Outcome::repaired(format!("report appended to {}", path)),
                    Err(e) => Outcome::failed(format!("could not write report to {}: {}", path, e)),
                }
            }
            None => {
                let written = writeln!(self.out, "R: {}", promiser).and_then(|_| self.out.flush());
                match written {
                    Ok(()) => Outcome::repaired("report written"),
                    Err(e) => Outcome::failed(format!("could not write report: {}", e)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_env, SharedBuffer};
    use cf_eval::{Bundle, PromiseResult};

    fn report(actuator: &mut ReportsActuator, ctx: &mut EvalContext, promise: Promise) -> Outcome {
        let bundle = Bundle::new("main");
        let mut frame = ctx.push_bundle_frame(&bundle, &[], false);
        let mut frame = frame.push_promise_type_frame("reports", 1);
        let promiser = frame.expand_scalar(&promise.promiser);
        actuator.actuate(&test_env(), &mut frame, &promise, &promiser)
    }

    #[test]
    fn writes_prefixed_line() {
        let buffer = SharedBuffer::default();
        let mut actuator = ReportsActuator::with_writer(Box::new(buffer.clone()));
        let mut ctx = EvalContext::new();
        let outcome = report(&mut actuator, &mut ctx, Promise::new("running on $(sys.os)"));
        assert_eq!(outcome.result, PromiseResult::Change);
        assert_eq!(buffer.text(), format!("R: running on {}\n", std::env::consts::OS));
    }

    #[test]
    fn report_to_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        let buffer = SharedBuffer::default();
        let mut actuator = ReportsActuator::with_writer(Box::new(buffer.clone()));
        let mut ctx = EvalContext::new();
        for line in ["one", "two"] {
            report(
                &mut actuator,
                &mut ctx,
                Promise::new(line).with_attribute("report_to_file", path.to_str().unwrap()),
            );
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
        assert!(buffer.text().is_empty());
    }
}
