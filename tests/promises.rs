use jsbridge::runtime::{
    Deferred, Env, Error, JSValue, PromiseState, RuntimeConfig, RuntimeHandle,
};
use std::sync::Arc;
use std::thread;

fn promise_state(handle: &RuntimeHandle, name: &'static str) -> PromiseState {
    handle
        .with_host(move |host| {
            let promise = host.env().global()?.get_named(name)?.as_promise()?;
            host.promise_state(&promise)
        })
        .unwrap()
        .unwrap()
}

#[test]
fn test_settled_from_worker_thread() {
    let mut handle = RuntimeHandle::spawn(RuntimeConfig::default()).unwrap();

    let settlement = handle
        .run_sync(|env| {
            let (promise, settlement) = env.new_result_promise::<Vec<i64>, String>()?;
            env.global()?.set_named("answer", &promise)?;
            Ok::<_, Error>(settlement)
        })
        .unwrap()
        .unwrap();
    assert_eq!(promise_state(&handle, "answer"), PromiseState::Pending);

    thread::spawn(move || settlement.settle(Ok(vec![4, 2])).unwrap())
        .join()
        .unwrap();
    handle.flush().unwrap();

    assert_eq!(
        promise_state(&handle, "answer"),
        PromiseState::Fulfilled(JSValue::Array(vec![JSValue::Int(4), JSValue::Int(2)]))
    );

    handle.close().unwrap();
}

#[test]
fn test_double_settle_is_rejected() {
    let mut handle = RuntimeHandle::spawn(RuntimeConfig::default()).unwrap();

    let settlement = handle
        .run_sync(|env| {
            let (promise, settlement) = env.new_deferred(
                |_env: &Env, deferred: Deferred, winner: usize| deferred.resolve(winner as f64),
            )?;
            env.global()?.set_named("race", &promise)?;
            Ok::<_, Error>(Arc::new(settlement))
        })
        .unwrap()
        .unwrap();

    let racers: Vec<_> = (0..4)
        .map(|racer| {
            let settlement = settlement.clone();
            thread::spawn(move || settlement.settle(racer))
        })
        .collect();
    let results: Vec<_> = racers.into_iter().map(|r| r.join().unwrap()).collect();
    handle.flush().unwrap();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results.iter().filter(|r| **r == Err(Error::AlreadySettled)).count(),
        3
    );
    let winner = results.iter().position(Result::is_ok).unwrap();
    assert_eq!(
        promise_state(&handle, "race"),
        PromiseState::Fulfilled(JSValue::Int(winner as i64))
    );

    handle.close().unwrap();
}

#[test]
fn test_error_rejects_with_message() {
    let mut handle = RuntimeHandle::spawn(RuntimeConfig::default()).unwrap();

    let settlement = handle
        .run_sync(|env| {
            let (promise, settlement) = env.new_result_promise::<String, String>()?;
            env.global()?.set_named("failing", &promise)?;
            Ok::<_, Error>(settlement)
        })
        .unwrap()
        .unwrap();

    settlement.settle(Err("disk full".to_string())).unwrap();
    handle.flush().unwrap();

    let PromiseState::Rejected(reason) = promise_state(&handle, "failing") else {
        panic!("promise should be rejected");
    };
    assert_eq!(reason.get("message").and_then(JSValue::as_str), Some("disk full"));

    handle.close().unwrap();
}
