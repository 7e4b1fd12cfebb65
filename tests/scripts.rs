//! Data-driven end-to-end tests: each `.rill` file under
//! `tests/scripts` holds an expected-output section, a `---` divider,
//! and the program to run. An expected section of a single
//! `error: ...` line asserts the run fails with exactly that message.

use std::{cell::RefCell, io, rc::Rc};

use datatest_stable::Utf8Path;
use rill::{Globals, Interpreter};

#[derive(thiserror::Error, Debug)]
#[error("script test failed at {0}")]
pub struct ScriptTestError(Box<Utf8Path>);

#[derive(Clone, Default)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn split_sections(contents: &str) -> Option<(String, String)> {
    let mut expected = Vec::new();
    let mut source = Vec::new();
    let mut in_source = false;
    for line in contents.lines() {
        if !in_source && line.trim_end() == "---" {
            in_source = true;
            continue;
        }
        if in_source {
            source.push(line);
        } else {
            expected.push(line);
        }
    }
    if !in_source {
        return None;
    }
    let mut source = source.join("\n");
    source.push('\n');
    let mut expected = expected.join("\n");
    if !expected.is_empty() {
        expected.push('\n');
    }
    Some((expected, source))
}

fn script_test(path: &Utf8Path, contents: String) -> datatest_stable::Result<()> {
    let Some((expected, source)) = split_sections(&contents) else {
        eprintln!("{path}: missing '---' divider between expected output and source");
        return Err(ScriptTestError(Box::from(path)).into());
    };

    let buffer = SharedBuffer::default();
    let mut interpreter = Interpreter::with_output(Globals::all(), Box::new(buffer.clone()));
    let result = interpreter.interpret(&source);
    let output = String::from_utf8(buffer.0.borrow().clone()).expect("script output is utf-8");

    match expected.strip_prefix("error: ") {
        Some(message) => {
            let Err(error) = result else {
                eprintln!("{path}: expected an error, but the script ran cleanly");
                return Err(ScriptTestError(Box::from(path)).into());
            };
            let rendered = error.to_string();
            if rendered != message.trim_end() {
                eprintln!("{path}: error mismatch\n\nGot:\n{rendered}\n\nExpected:\n{message}");
                return Err(ScriptTestError(Box::from(path)).into());
            }
        }
        None => {
            if let Err(error) = result {
                eprintln!("{path}: script failed: {error}");
                return Err(ScriptTestError(Box::from(path)).into());
            }
            if output != expected {
                eprintln!("{path}: output mismatch\n\nGot:\n{output}\nExpected:\n{expected}");
                return Err(ScriptTestError(Box::from(path)).into());
            }
        }
    }
    Ok(())
}

datatest_stable::harness! {
    script_test, "tests/scripts", r"^.*\.rill$",
}
