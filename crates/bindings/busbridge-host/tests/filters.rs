use std::cell::RefCell;
use std::rc::Rc;

use busbridge_host::{BindError, Bus, CloseOnFinalize, Filter, FilterError, Runtime};
use busbridge_protocol::{BusType, DispatchStatus, HandlerResult, MatchRule, MessageHeader};
use busbridge_transport::{LoopbackTransport, Transport};

type CallLog = Rc<RefCell<Vec<&'static str>>>;

fn setup() -> (Rc<LoopbackTransport>, Runtime, Bus) {
    let _ = env_logger::builder().is_test(true).try_init();
    let transport = Rc::new(LoopbackTransport::new());
    let runtime = Runtime::new(transport.clone());
    let bus = runtime.bus_get(BusType::Session).expect("bus");
    (transport, runtime, bus)
}

fn recording(log: &CallLog, name: &'static str, verdict: HandlerResult) -> Filter {
    let log = Rc::clone(log);
    Filter::new(move |_, _| {
        log.borrow_mut().push(name);
        Ok(verdict)
    })
}

fn deliver_signal(transport: &LoopbackTransport, bus: &Bus) {
    transport
        .inject(bus.handle(), MessageHeader::signal("/org/example", "com.example.Foo", "Bar"))
        .expect("inject");
}

#[test]
fn filters_run_in_registration_order() {
    let (transport, _runtime, bus) = setup();
    let log = CallLog::default();
    for name in ["A", "B", "C"] {
        bus.add_filter(recording(&log, name, HandlerResult::NotYetHandled)).expect("add");
    }

    deliver_signal(&transport, &bus);
    assert_eq!(bus.dispatch().expect("dispatch"), DispatchStatus::Complete);
    assert_eq!(*log.borrow(), ["A", "B", "C"]);
}

#[test]
fn handled_stops_the_chain() {
    let (transport, _runtime, bus) = setup();
    let log = CallLog::default();
    bus.add_filter(recording(&log, "A", HandlerResult::NotYetHandled)).expect("add");
    bus.add_filter(recording(&log, "B", HandlerResult::Handled)).expect("add");
    bus.add_filter(recording(&log, "C", HandlerResult::NotYetHandled)).expect("add");

    deliver_signal(&transport, &bus);
    bus.dispatch().expect("dispatch");
    assert_eq!(*log.borrow(), ["A", "B"]);
}

#[test]
fn removed_filter_is_skipped() {
    let (transport, _runtime, bus) = setup();
    let log = CallLog::default();
    let b = recording(&log, "B", HandlerResult::NotYetHandled);
    bus.add_filter(recording(&log, "A", HandlerResult::NotYetHandled)).expect("add");
    bus.add_filter(b.clone()).expect("add");
    bus.add_filter(recording(&log, "C", HandlerResult::NotYetHandled)).expect("add");

    bus.remove_filter(&b).expect("remove");
    deliver_signal(&transport, &bus);
    bus.dispatch().expect("dispatch");
    assert_eq!(*log.borrow(), ["A", "C"]);
}

#[test]
fn duplicate_registrations_run_once_each_and_remove_from_the_end() {
    let (transport, _runtime, bus) = setup();
    let log = CallLog::default();
    let a = recording(&log, "A", HandlerResult::NotYetHandled);
    let b = recording(&log, "B", HandlerResult::NotYetHandled);
    bus.add_filter(a.clone()).expect("add");
    bus.add_filter(b.clone()).expect("add");
    bus.add_filter(a.clone()).expect("add");

    deliver_signal(&transport, &bus);
    bus.dispatch().expect("dispatch");
    assert_eq!(*log.borrow(), ["A", "B", "A"]);

    bus.remove_filter(&a).expect("remove");
    log.borrow_mut().clear();
    deliver_signal(&transport, &bus);
    bus.dispatch().expect("dispatch");
    assert_eq!(*log.borrow(), ["A", "B"]);
}

#[test]
fn removing_an_unregistered_filter_fails() {
    let (_transport, _runtime, bus) = setup();
    let stray = Filter::new(|_, _| Ok(HandlerResult::Handled));
    assert_eq!(bus.remove_filter(&stray), Err(BindError::NotRegistered));

    bus.add_filter(Filter::new(|_, _| Ok(HandlerResult::Handled))).expect("add");
    assert_eq!(bus.remove_filter(&stray), Err(BindError::NotRegistered));
    assert_eq!(bus.filter_count(), 1);
}

#[test]
fn filter_error_ends_the_cycle_and_keeps_the_list() {
    let (transport, _runtime, bus) = setup();
    let log = CallLog::default();
    bus.add_filter(Filter::new(|_, _| Err(FilterError::new("boom")))).expect("add");
    bus.add_filter(recording(&log, "after", HandlerResult::Handled)).expect("add");

    deliver_signal(&transport, &bus);
    let err = bus.dispatch().unwrap_err();
    assert_eq!(err, BindError::Filter(FilterError::new("boom")));
    assert!(log.borrow().is_empty());
    assert_eq!(bus.filter_count(), 2);

    // Nothing left over for the next cycle.
    assert_eq!(bus.dispatch().expect("dispatch"), DispatchStatus::Complete);
}

#[test]
fn filter_error_outranks_a_later_transport_failure() {
    let (transport, _runtime, bus) = setup();
    let native = Rc::clone(&transport);
    bus.add_filter(Filter::new(move |_, message| {
        // Drop both the queue's and the wrapper's references, so the
        // transport's own release after the hook fails.
        native.release(message.handle()).expect("release");
        native.release(message.handle()).expect("release");
        Err(FilterError::new("refused"))
    }))
    .expect("add");

    deliver_signal(&transport, &bus);
    let err = bus.dispatch().unwrap_err();
    assert_eq!(err, BindError::Filter(FilterError::new("refused")));
    assert!(transport.release_faults() > 0);
}

#[test]
fn filter_receives_the_connection_wrapper_and_message() {
    let (transport, _runtime, bus) = setup();
    let seen: Rc<RefCell<Option<(bool, Option<String>)>>> = Rc::default();
    let sink = Rc::clone(&seen);
    // Capturing the bus itself would make it own its own filter.
    let handle = bus.as_connection().handle();
    bus.add_filter(Filter::new(move |conn, msg| {
        let header = msg.header().map_err(FilterError::from)?;
        *sink.borrow_mut() = Some((conn.handle() == handle, header.member));
        Ok(HandlerResult::Handled)
    }))
    .expect("add");

    deliver_signal(&transport, &bus);
    bus.dispatch().expect("dispatch");
    assert_eq!(*seen.borrow(), Some((true, Some("Bar".to_string()))));
}

#[test]
fn dispatch_from_inside_a_filter_is_rejected() {
    let (transport, _runtime, bus) = setup();
    let outcome: Rc<RefCell<Option<BindError>>> = Rc::default();
    let sink = Rc::clone(&outcome);
    bus.add_filter(Filter::new(move |conn, _| {
        *sink.borrow_mut() = conn.dispatch().err();
        Ok(HandlerResult::Handled)
    }))
    .expect("add");

    deliver_signal(&transport, &bus);
    bus.dispatch().expect("dispatch");
    let err = outcome.borrow_mut().take().expect("nested dispatch must fail");
    assert!(err.is_fatal(), "{err}");
}

#[test]
fn filters_added_during_dispatch_start_next_cycle() {
    let (transport, _runtime, bus) = setup();
    let log = CallLog::default();
    let late = recording(&log, "late", HandlerResult::NotYetHandled);
    let adder_log = Rc::clone(&log);
    bus.add_filter(Filter::new(move |conn, _| {
        adder_log.borrow_mut().push("adder");
        if conn.filter_count() == 1 {
            conn.add_filter(late.clone())?;
        }
        Ok(HandlerResult::NotYetHandled)
    }))
    .expect("add");

    deliver_signal(&transport, &bus);
    bus.dispatch().expect("dispatch");
    assert_eq!(*log.borrow(), ["adder"]);

    deliver_signal(&transport, &bus);
    bus.dispatch().expect("dispatch");
    assert_eq!(*log.borrow(), ["adder", "adder", "late"]);
}

#[test]
fn need_memory_leaves_the_message_queued() {
    let (transport, _runtime, bus) = setup();
    bus.add_filter(Filter::new(|_, _| Ok(HandlerResult::NeedMemory))).expect("add");

    deliver_signal(&transport, &bus);
    assert_eq!(bus.dispatch().expect("dispatch"), DispatchStatus::NeedMemory);
    assert_eq!(bus.get_dispatch_status().expect("status"), DispatchStatus::DataRemains);
}

#[test]
fn need_memory_stops_the_chain() {
    let (transport, _runtime, bus) = setup();
    let log = CallLog::default();
    bus.add_filter(recording(&log, "A", HandlerResult::NotYetHandled)).expect("add");
    bus.add_filter(recording(&log, "B", HandlerResult::NeedMemory)).expect("add");
    bus.add_filter(recording(&log, "C", HandlerResult::Handled)).expect("add");

    deliver_signal(&transport, &bus);
    assert_eq!(bus.dispatch().expect("dispatch"), DispatchStatus::NeedMemory);
    assert_eq!(*log.borrow(), ["A", "B"]);
}

#[test]
fn finalizing_the_connection_ends_the_chain() {
    let (transport, _runtime, bus) = setup();
    let log = CallLog::default();
    let first = Rc::clone(&log);
    bus.add_filter(Filter::new(move |conn, _| {
        first.borrow_mut().push("A");
        conn.finalize()?;
        Ok(HandlerResult::NotYetHandled)
    }))
    .expect("add");
    bus.add_filter(recording(&log, "B", HandlerResult::Handled)).expect("add");

    deliver_signal(&transport, &bus);
    assert_eq!(bus.dispatch().expect("dispatch"), DispatchStatus::Complete);
    assert_eq!(*log.borrow(), ["A"]);
    assert!(bus.is_finalized());
}

#[test]
fn finalize_removes_the_native_hook() {
    let (transport, _runtime, bus) = setup();
    bus.add_filter(Filter::new(|_, _| Ok(HandlerResult::Handled))).expect("add");
    assert!(transport.has_filter_hook(bus.handle()));

    bus.finalize().expect("finalize");
    assert!(!transport.has_filter_hook(bus.handle()));
    assert_eq!(bus.filter_count(), 0);
    assert!(matches!(
        bus.add_filter(Filter::new(|_, _| Ok(HandlerResult::Handled))),
        Err(BindError::InvalidArgument(_))
    ));
}

#[test]
fn subscribed_signal_reaches_bus_filters() {
    let (transport, runtime, bus) = setup();
    bus.add_match(&MatchRule::new().msg_type("signal").interface("com.example.Foo"))
        .expect("add_match");
    let log = CallLog::default();
    bus.add_filter(recording(&log, "subscriber", HandlerResult::Handled)).expect("add");

    let peer = transport.open_bus_peer(BusType::Session);
    let sender = runtime.adopt_connection(peer, CloseOnFinalize::Close).expect("wrap");
    let signal = runtime
        .message_new_signal("/org/example", "com.example.Foo", "Bar")
        .expect("signal");
    let unrelated = runtime
        .message_new_signal("/org/example", "com.example.Other", "Bar")
        .expect("signal");
    assert!(sender.send(&signal).expect("send"));
    assert!(sender.send(&unrelated).expect("send"));
    assert!(sender.read_write(0).expect("read_write"));

    assert!(bus.read_write_dispatch(0).expect("read_write_dispatch"));
    assert_eq!(*log.borrow(), ["subscriber"]);
    assert_eq!(bus.get_dispatch_status().expect("status"), DispatchStatus::Complete);
}
