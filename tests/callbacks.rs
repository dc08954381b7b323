use jsbridge::runtime::{Error, JSValue, Rest, RuntimeConfig, RuntimeHandle, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn spawn() -> RuntimeHandle {
    RuntimeHandle::spawn(RuntimeConfig::default()).unwrap()
}

#[test]
fn test_string_and_number_arguments() {
    let mut handle = spawn();

    handle
        .register_function("concat", |_this: Value, text: String, n: f64| {
            format!("{text}{n}")
        })
        .unwrap();
    let result = handle
        .call_global("concat", vec![JSValue::from("hi"), JSValue::Int(5)])
        .unwrap();
    assert_eq!(result, JSValue::String("hi5".to_string()));

    handle.close().unwrap();
}

#[test]
fn test_wrong_receiver_throws_without_invoking() {
    let mut handle = spawn();
    let invocations = Arc::new(AtomicUsize::new(0));

    let counter = invocations.clone();
    let result = handle
        .run_sync(move |env| -> jsbridge::Result<Option<Error>> {
            let function = env.new_function("shout", move |this: String| {
                counter.fetch_add(1, Ordering::SeqCst);
                this.to_uppercase()
            })?;
            let receiver = env.value_of(42)?;
            match function.call(&receiver, &[]) {
                Ok(_) => Ok(None),
                Err(err) => Ok(Some(env.catch_exception(err))),
            }
        })
        .unwrap()
        .unwrap();

    assert_eq!(
        result,
        Some(Error::Exception(
            "this: expected string, got incompatible type: number".to_string()
        ))
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    handle.close().unwrap();
}

#[test]
fn test_arity_is_checked_before_conversion() {
    let mut handle = spawn();

    handle
        .register_function("pair", |_this: Value, a: String, b: String| format!("{a}{b}"))
        .unwrap();
    let err = handle
        .call_global("pair", vec![JSValue::Int(1)])
        .unwrap_err();
    assert_eq!(
        err,
        Error::Exception("Expected 2 argument(s), got 1".to_string())
    );

    handle.close().unwrap();
}

#[test]
fn test_fallible_callback_throws_message_verbatim() {
    let mut handle = spawn();

    handle
        .register_function("open", |_this: Value, path: String| -> Result<String, String> {
            Err(format!("{path}: not found"))
        })
        .unwrap();
    let err = handle
        .call_global("open", vec![JSValue::from("/etc/none")])
        .unwrap_err();
    assert_eq!(err, Error::Exception("/etc/none: not found".to_string()));

    handle.close().unwrap();
}

#[test]
fn test_variadic_tail() {
    let mut handle = spawn();

    handle
        .register_function("join", |_this: Value, sep: String, parts: Rest<String>| {
            parts.join(&sep)
        })
        .unwrap();
    let joined = handle
        .call_global(
            "join",
            vec![
                JSValue::from("-"),
                JSValue::from("a"),
                JSValue::from("b"),
                JSValue::from("c"),
            ],
        )
        .unwrap();
    assert_eq!(joined, JSValue::from("a-b-c"));

    let empty = handle.call_global("join", vec![JSValue::from("-")]).unwrap();
    assert_eq!(empty, JSValue::from(""));

    handle.close().unwrap();
}

#[test]
fn test_invalid_signature_is_rejected_at_registration() {
    let mut handle = spawn();

    let err = handle
        .register_function("broken", |_this: Value, rest: Rest<String>, _last: String| {
            rest.len() as f64
        })
        .unwrap_err();
    assert!(matches!(err, Error::Signature(_)));

    handle.close().unwrap();
}
