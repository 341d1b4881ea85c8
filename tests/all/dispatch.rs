use super::*;
use anyhow::Result;
use faaslet::openmp::{self, Level};
use faaslet::{current_message, BatchType, Error, ThreadRequestType};

fn functions_batch(msg: Message) -> BatchExecuteRequest {
    BatchExecuteRequest::new(BatchType::Functions, vec![msg])
}

fn try_function(module: &WasmModule, msg: &mut Message) -> faaslet::Result<i32> {
    module.try_execute_task(0, BatchType::Functions, ThreadRequestType::Unknown, None, msg)
}

#[test]
fn function_output_and_return_value() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::new(|ctx, entry| {
        assert_eq!(entry, Entry::Main);
        ctx.message_mut().output_data = "done".to_string();
        Ok(0)
    }));

    let mut req = functions_batch(Message::new("u", "f"));
    assert_eq!(module.execute_task(0, 0, &mut req), 0);
    assert_eq!(req.messages[0].output_data, "done");
    assert_eq!(req.messages[0].return_value, 0);
    Ok(())
}

#[test]
fn non_zero_return_value_is_recorded() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::new(|_, _| Ok(3)));

    let mut req = functions_batch(Message::new("u", "f"));
    assert_eq!(module.execute_task(0, 0, &mut req), 3);
    assert_eq!(req.messages[0].output_data, "Call failed (return value=3)");
    assert_eq!(req.messages[0].return_value, 3);
    Ok(())
}

#[test]
fn guest_error_returns_one() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::new(|_, _| Err(Error::BackendFailed(-7))));

    let mut req = functions_batch(Message::new("u", "f"));
    assert_eq!(module.execute_task(0, 0, &mut req), 1);
    assert_eq!(req.messages[0].output_data, "Call failed (return value=1)");
    Ok(())
}

#[test]
fn captured_stdout_is_prepended() -> Result<()> {
    let mut h = Harness::new();
    h.config.with_capture_stdout(true);
    let module = h.bound_module(TestBackend::new(|ctx, _| {
        ctx.module().stdout().capture_line(c"hello")?;
        ctx.message_mut().output_data = "result".to_string();
        Ok(0)
    }));

    let mut req = functions_batch(Message::new("u", "f"));
    assert_eq!(module.execute_task(0, 0, &mut req), 0);
    assert_eq!(req.messages[0].output_data, "hello\nresult");
    assert!(module.stdout().is_empty());
    Ok(())
}

#[test]
fn captured_stdout_precedes_failure() -> Result<()> {
    let mut h = Harness::new();
    h.config.with_capture_stdout(true);
    let module = h.bound_module(TestBackend::new(|ctx, _| {
        ctx.module().stdout().capture_line(c"oops")?;
        Ok(2)
    }));

    let mut req = functions_batch(Message::new("u", "f"));
    assert_eq!(module.execute_task(0, 0, &mut req), 2);
    assert_eq!(
        req.messages[0].output_data,
        "oops\nCall failed (return value=2)"
    );
    Ok(())
}

#[test]
fn stdout_left_alone_without_capture() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::new(|ctx, _| {
        ctx.module().stdout().capture_line(c"kept")?;
        Ok(0)
    }));

    let mut req = functions_batch(Message::new("u", "f"));
    assert_eq!(module.execute_task(0, 0, &mut req), 0);
    assert_eq!(req.messages[0].output_data, "");
    assert_eq!(module.captured_stdout()?, "kept\n");
    Ok(())
}

#[test]
fn wrong_function_is_rejected() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());

    let mut msg = Message::new("u", "other");
    match try_function(&module, &mut msg) {
        Err(Error::FunctionMismatch { bound, requested }) => {
            assert_eq!(bound, "u/f");
            assert_eq!(requested, "u/other");
        }
        other => panic!("unexpected result {other:?}"),
    }

    let mut req = functions_batch(Message::new("u", "other"));
    assert_eq!(module.execute_task(0, 0, &mut req), 1);
    Ok(())
}

#[test]
fn unbound_module_is_rejected() -> Result<()> {
    let h = Harness::new();
    let module = h.module(TestBackend::noop());
    let mut msg = Message::new("u", "f");
    assert!(matches!(
        try_function(&module, &mut msg),
        Err(Error::NotBound)
    ));
    Ok(())
}

#[test]
fn binding_twice_fails() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    match module.bind(&Message::new("v", "g"), false) {
        Err(Error::AlreadyBound { user, function }) => {
            assert_eq!(user, "u");
            assert_eq!(function, "f");
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(module.bound_user(), Some("u"));
    assert_eq!(module.bound_function(), Some("f"));
    Ok(())
}

#[test]
fn thread_subtypes_pick_entry_points() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::new(|ctx, entry| {
        let rv = match entry {
            Entry::Main => 100,
            Entry::Pthread { thread_idx, stack_top } => {
                assert_eq!(ctx.module().thread_stacks()[thread_idx], stack_top);
                assert_eq!(ctx.message().input_data, "64");
                200
            }
            Entry::Omp { thread_idx, stack_top } => {
                assert_eq!(ctx.module().thread_stacks()[thread_idx], stack_top);
                let level = openmp::current_level().unwrap();
                assert_eq!(level.num_threads, 2);
                300
            }
        };
        ctx.message_mut().output_data = rv.to_string();
        Ok(0)
    }));

    let mut msg = Message::new("u", "f");
    msg.input_data = "64".to_string();
    let mut req = BatchExecuteRequest::new(BatchType::Threads, vec![msg.clone(), msg.clone()])
        .with_subtype(ThreadRequestType::Pthread);
    assert_eq!(module.execute_task(1, 1, &mut req), 0);
    assert_eq!(req.messages[1].output_data, "200");

    let mut req = BatchExecuteRequest::new(BatchType::Threads, vec![msg.clone()])
        .with_subtype(ThreadRequestType::OpenMp)
        .with_omp_level(Level::new().next_level(2));
    assert_eq!(module.execute_task(0, 0, &mut req), 0);
    assert_eq!(req.messages[0].output_data, "300");
    assert!(openmp::current_level().is_none());

    let mut req = functions_batch(msg);
    assert_eq!(module.execute_task(0, 0, &mut req), 0);
    assert_eq!(req.messages[0].output_data, "100");
    Ok(())
}

#[test]
fn unknown_thread_subtype() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    let mut msg = Message::new("u", "f");
    assert!(matches!(
        module.try_execute_task(0, BatchType::Threads, ThreadRequestType::Unknown, None, &mut msg),
        Err(Error::UnknownThreadSubtype)
    ));
    Ok(())
}

#[test]
fn thread_without_stack() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    let mut msg = Message::new("u", "f");
    assert!(matches!(
        module.try_execute_task(5, BatchType::Threads, ThreadRequestType::Pthread, None, &mut msg),
        Err(Error::NoThreadStack(5))
    ));
    Ok(())
}

#[test]
fn missing_message_index() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    let mut req = functions_batch(Message::new("u", "f"));
    assert_eq!(module.execute_task(0, 3, &mut req), 1);
    Ok(())
}

#[test]
fn function_deletes_app_snapshot() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    let mut msg = Message::new("u", "f");
    msg.app_id = faaslet::generate_gid();
    let key = module.get_or_create_app_snapshot(&msg, false)?;

    let mut req = functions_batch(msg);
    assert_eq!(module.execute_task(0, 0, &mut req), 0);
    assert!(!h.registry.exists(&key));
    assert_eq!(*h.scheduler.deleted.lock().unwrap(), [key]);
    Ok(())
}

#[test]
fn context_is_current_during_call() -> Result<()> {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::new(|ctx, _| {
        let current = current_message().unwrap();
        assert_eq!(current.id, ctx.message().id);
        assert_eq!(current.cmdline, "outer");

        // Nested calls see their own message, then the outer one again.
        let mut inner = Message::new("u", "f");
        inner.cmdline = "inner".to_string();
        let nested = ExecutionContext::new(ctx.module(), inner);
        nested.enter(|_| {
            assert_eq!(current_message().unwrap().cmdline, "inner");
        });
        assert_eq!(current_message().unwrap().cmdline, "outer");

        ExecutionContext::with_current(|c| {
            assert!(std::ptr::eq(c.unwrap().module(), ctx.module()));
        });
        Ok(0)
    }));

    assert!(current_message().is_none());
    let mut msg = Message::new("u", "f");
    msg.cmdline = "outer".to_string();
    let id = msg.id;
    let mut req = functions_batch(msg);
    assert_eq!(module.execute_task(0, 0, &mut req), 0);
    assert!(current_message().is_none());

    // The message went through the context and came back.
    assert_eq!(req.messages[0].id, id);
    assert_eq!(req.messages[0].cmdline, "outer");
    Ok(())
}

#[test]
fn context_restored_after_panic() {
    let h = Harness::new();
    let module = h.bound_module(TestBackend::noop());
    let ctx = ExecutionContext::new(&module, Message::new("u", "f"));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        ctx.enter(|_| panic!("guest trapped"))
    }));
    assert!(result.is_err());
    assert!(current_message().is_none());
}
