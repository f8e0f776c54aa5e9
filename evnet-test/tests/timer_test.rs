//! Timer behavior under the polling loop.

use evnet::{Error, PollMethod, Reactor, jiffies};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[test]
fn timers_fire_in_deadline_order() {
    evnet_test::init_logging();

    let reactor = Reactor::new();
    reactor.set_method(PollMethod::Poll).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));

    // Started out of order on purpose.
    for delay in [10u64, 30, 20] {
        let order = order.clone();
        let re = reactor.clone();
        reactor.timer_start(delay, move || {
            let mut order = order.lock().unwrap();
            order.push(delay);
            if order.len() == 3 {
                re.cancel();
            }
        });
    }

    reactor.run().unwrap();
    assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
}

#[test]
fn zero_delay_timer_fires_without_blocking() {
    let reactor = Reactor::new();
    reactor.set_method(PollMethod::Poll).unwrap();

    let fired_at = Arc::new(Mutex::new(None));
    let fired = fired_at.clone();
    let re = reactor.clone();
    let start = Instant::now();
    reactor.timer_start(0, move || {
        *fired.lock().unwrap() = Some(jiffies());
        re.cancel();
    });

    reactor.run().unwrap();
    assert!(fired_at.lock().unwrap().is_some());
    assert!(
        start.elapsed() < Duration::from_millis(500),
        "due timer must fire on the next pass"
    );
}

#[test]
fn run_while_polling_is_rejected() {
    let reactor = Reactor::new();
    reactor.set_method(PollMethod::Poll).unwrap();

    let seen = Arc::new(Mutex::new(None));
    let seen_cb = seen.clone();
    let re = reactor.clone();
    reactor.timer_start(1, move || {
        // Re-entering run from a handler must fail cleanly.
        *seen_cb.lock().unwrap() = Some(re.run().unwrap_err());
        re.cancel();
    });

    reactor.run().unwrap();
    assert!(matches!(
        seen.lock().unwrap().take(),
        Some(Error::AlreadyPolling)
    ));
}

#[test]
fn canceled_timer_does_not_fire() {
    let reactor = Reactor::new();
    reactor.set_method(PollMethod::Poll).unwrap();

    let key = reactor.timer_start(5, || panic!("canceled timer fired"));
    assert!(reactor.timer_cancel(key));

    let re = reactor.clone();
    reactor.timer_start(30, move || re.cancel());
    reactor.run().unwrap();
}

#[test]
fn injected_external_lock_does_not_stall_the_loop() {
    let reactor = Reactor::new();
    reactor.set_method(PollMethod::Poll).unwrap();

    let lock = Arc::new(evnet::parking_lot::Mutex::new(()));
    reactor.set_external_lock(Some(lock.clone()));

    // Hold the injected lock briefly from outside while the loop runs.
    let contender = {
        let lock = lock.clone();
        std::thread::spawn(move || {
            let guard = lock.lock();
            std::thread::sleep(Duration::from_millis(20));
            drop(guard);
        })
    };

    let re = reactor.clone();
    reactor.timer_start(40, move || re.cancel());
    reactor.run().unwrap();
    contender.join().unwrap();

    // The loop released the injected lock on exit.
    assert!(lock.try_lock().is_some());
    reactor.set_external_lock(None);
}

#[test]
fn handlers_can_start_timers() {
    let reactor = Reactor::new();
    reactor.set_method(PollMethod::Poll).unwrap();

    let hits = Arc::new(Mutex::new(0u32));
    let hits_cb = hits.clone();
    let re = reactor.clone();
    reactor.timer_start(5, move || {
        *hits_cb.lock().unwrap() += 1;
        let hits2 = hits_cb.clone();
        let re2 = re.clone();
        re.timer_start(5, move || {
            *hits2.lock().unwrap() += 1;
            re2.cancel();
        });
    });

    reactor.run().unwrap();
    assert_eq!(*hits.lock().unwrap(), 2);
}
