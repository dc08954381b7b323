use jsbridge::runtime::{
    Error, JSValue, RuntimeConfig, RuntimeHandle, ThreadsafeFunction, Value,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

const PRODUCERS: u32 = 3;
const CALLS_PER_PRODUCER: u32 = 100;

#[test]
fn test_concurrent_producers_deliver_exactly_once() {
    let mut handle = RuntimeHandle::spawn(RuntimeConfig::default()).unwrap();
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let finalized = Arc::new(AtomicUsize::new(0));
    let delivered_at_finalize = Arc::new(AtomicUsize::new(0));

    let sink = delivered.clone();
    let seen = delivered.clone();
    let finalize_count = finalized.clone();
    let finalize_seen = delivered_at_finalize.clone();
    let tsfn = handle
        .run_sync(move |env| {
            ThreadsafeFunction::builder(env, "producers", "shared".to_string())
                .max_queue_size(16)
                .finalizer(move |_env, context: &String| {
                    assert_eq!(context, "shared");
                    finalize_seen.store(seen.lock().unwrap().len(), Ordering::SeqCst);
                    finalize_count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .build(move |_env, _callback, context: &String, item: u32| {
                    sink.lock().unwrap().push((context.clone(), item));
                    Ok(())
                })
        })
        .unwrap()
        .unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            tsfn.acquire().unwrap();
            let tsfn = tsfn.clone();
            thread::spawn(move || {
                for n in 0..CALLS_PER_PRODUCER {
                    tsfn.call(producer * CALLS_PER_PRODUCER + n).unwrap();
                }
                tsfn.release().unwrap();
            })
        })
        .collect();
    tsfn.release().unwrap();

    for producer in producers {
        producer.join().unwrap();
    }
    handle.flush().unwrap();

    let delivered = delivered.lock().unwrap();
    assert_eq!(delivered.len(), (PRODUCERS * CALLS_PER_PRODUCER) as usize);
    assert!(delivered.iter().all(|(context, _)| context == "shared"));
    let unique: HashSet<u32> = delivered.iter().map(|(_, item)| *item).collect();
    assert_eq!(unique.len(), delivered.len());
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    assert_eq!(delivered_at_finalize.load(Ordering::SeqCst), delivered.len());

    assert!(!tsfn.is_valid());
    assert_eq!(tsfn.call(0), Err(Error::Closing));

    handle.close().unwrap();
}

#[test]
fn test_default_dispatcher_calls_bound_function() {
    let mut handle = RuntimeHandle::spawn(RuntimeConfig::default()).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = received.clone();
    let tsfn = handle
        .run_sync(move |env| {
            let record = env.new_function("record", move |_this: Value, line: String| {
                sink.lock().unwrap().push(line);
            })?;
            ThreadsafeFunction::builder(env, "lines", ())
                .callback(&record)
                .build_default::<String>()
        })
        .unwrap()
        .unwrap();

    let worker = thread::spawn(move || {
        tsfn.call("first".to_string()).unwrap();
        tsfn.call("second".to_string()).unwrap();
        tsfn.release().unwrap();
    });
    worker.join().unwrap();
    handle.flush().unwrap();

    assert_eq!(*received.lock().unwrap(), vec!["first", "second"]);
    assert!(handle.take_uncaught_exceptions().unwrap().is_empty());

    handle.close().unwrap();
}

#[test]
fn test_dispatcher_errors_become_uncaught_exceptions() {
    let mut handle = RuntimeHandle::spawn(RuntimeConfig::default()).unwrap();

    let tsfn = handle
        .run_sync(|env| {
            ThreadsafeFunction::builder(env, "failing", ()).build(
                |_env, _callback, _context, item: JSValue| {
                    Err(Error::application(format!("cannot handle {:?}", item)))
                },
            )
        })
        .unwrap()
        .unwrap();

    tsfn.call(JSValue::Int(1)).unwrap();
    tsfn.release().unwrap();
    handle.flush().unwrap();

    assert_eq!(
        handle.take_uncaught_exceptions().unwrap(),
        vec!["cannot handle Int(1)".to_string()]
    );

    handle.close().unwrap();
}

#[test]
fn test_calls_after_close_fail() {
    let mut handle = RuntimeHandle::spawn(RuntimeConfig::default()).unwrap();

    let tsfn = handle
        .run_sync(|env| {
            ThreadsafeFunction::builder(env, "orphan", ())
                .build(|_env, _callback, _context, _item: u8| Ok(()))
        })
        .unwrap()
        .unwrap();
    handle.close().unwrap();

    assert_eq!(tsfn.call(1), Err(Error::Closing));
}

#[test]
fn test_loop_close_racing_producers() {
    let mut handle = RuntimeHandle::spawn(RuntimeConfig::default()).unwrap();
    let delivered = Arc::new(Mutex::new(Vec::new()));

    let sink = delivered.clone();
    let tsfn = handle
        .run_sync(move |env| {
            ThreadsafeFunction::builder(env, "racing", ())
                .build(move |_env, _callback, _context, item: u32| {
                    sink.lock().unwrap().push(item);
                    Ok(())
                })
        })
        .unwrap()
        .unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let tsfn = tsfn.clone();
            thread::spawn(move || {
                let mut accepted = Vec::new();
                for n in 0..CALLS_PER_PRODUCER {
                    let item = producer * CALLS_PER_PRODUCER + n;
                    match tsfn.call(item) {
                        Ok(()) => accepted.push(item),
                        Err(Error::Closing) => {}
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                }
                accepted
            })
        })
        .collect();
    thread::sleep(std::time::Duration::from_millis(1));
    handle.with_host(|host| host.close_loop()).unwrap();

    let mut accepted: Vec<u32> = producers
        .into_iter()
        .flat_map(|producer| producer.join().unwrap())
        .collect();
    handle.flush().unwrap();

    let mut delivered = delivered.lock().unwrap().clone();
    accepted.sort_unstable();
    delivered.sort_unstable();
    assert_eq!(delivered, accepted);
    assert!(!tsfn.is_valid());
    assert_eq!(tsfn.call(0), Err(Error::Closing));

    handle.close().unwrap();
}
