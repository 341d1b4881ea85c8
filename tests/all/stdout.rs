use super::*;
use anyhow::Result;
use std::io::IoSlice;

#[test]
fn capture_and_clear() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());

    assert_eq!(module.captured_stdout()?, "");
    module.stdout().capture(&[IoSlice::new(b"hello\n")])?;
    module.stdout().capture(&[IoSlice::new(b"world\n")])?;
    assert_eq!(module.captured_stdout()?, "hello\nworld\n");

    module.clear_captured_stdout();
    assert_eq!(module.captured_stdout()?, "");
    assert!(module.stdout().is_empty());
    Ok(())
}

#[test]
fn capture_gathers_iovecs() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    let written = module.stdout().capture(&[
        IoSlice::new(b"a"),
        IoSlice::new(b""),
        IoSlice::new(b"bc"),
        IoSlice::new(b"\n"),
    ])?;
    assert_eq!(written, 4);
    assert_eq!(module.stdout().len(), 4);
    assert_eq!(module.captured_stdout()?, "abc\n");
    Ok(())
}

#[test]
fn capture_line_appends_newline() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    assert_eq!(module.stdout().capture_line(c"first")?, 6);
    module.stdout().capture_line(c"second")?;
    assert_eq!(module.captured_stdout()?, "first\nsecond\n");
    Ok(())
}

#[test]
fn capture_after_clear_starts_over() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    module.stdout().capture_line(c"old")?;
    module.clear_captured_stdout();
    module.stdout().capture_line(c"new")?;
    assert_eq!(module.captured_stdout()?, "new\n");
    Ok(())
}
