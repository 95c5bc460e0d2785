use std::rc::Rc;

use busbridge_host::{BindError, CloseOnFinalize, Filter, Runtime};
use busbridge_protocol::{BusType, HandlerResult, MessageHeader, MessageType};
use busbridge_transport::{LoopbackTransport, Transport};

fn setup() -> (Rc<LoopbackTransport>, Runtime) {
    let transport = Rc::new(LoopbackTransport::new());
    let runtime = Runtime::new(transport.clone());
    (transport, runtime)
}

#[test]
fn same_handle_yields_same_wrapper() {
    let (transport, runtime) = setup();
    let first = runtime.bus_get(BusType::Session).expect("bus");
    let second = runtime.bus_get(BusType::Session).expect("bus");

    assert!(first.ptr_eq(&second));
    assert_eq!(first.handle(), second.handle());
    // The second bus_get adopted a reference the wrapper did not need.
    assert_eq!(transport.ref_count(first.handle()), Some(1));
    assert_eq!(runtime.live_wrappers(), 1);
}

#[test]
fn borrowed_message_resolves_to_existing_wrapper() {
    let (transport, runtime) = setup();
    let bus = runtime.bus_get(BusType::Session).expect("bus");
    let msg = transport
        .inject(bus.handle(), MessageHeader::new(MessageType::Signal))
        .expect("inject");

    let first = bus.borrow_message().expect("borrow").expect("queued");
    bus.return_message(&first).expect("return");
    let second = bus.borrow_message().expect("borrow").expect("queued");
    assert!(first.ptr_eq(&second));
    assert_eq!(first.handle(), msg);
    // One reference for the queue, one for the wrapper.
    assert_eq!(transport.ref_count(msg), Some(2));
}

#[test]
fn collected_wrapper_is_recreated_with_empty_filter_list() {
    let (transport, runtime) = setup();
    let bus = runtime.bus_get(BusType::Session).expect("bus");
    let handle = bus.handle();
    bus.add_filter(Filter::new(|_, _| Ok(HandlerResult::NotYetHandled))).expect("filter");
    assert!(transport.has_filter_hook(handle));

    // Keep the native object alive past the wrapper.
    transport.retain(handle).expect("retain");
    drop(bus);
    assert!(!transport.has_filter_hook(handle));
    assert_eq!(runtime.tracked_handles(), 0);

    let again = runtime.bus_get(BusType::Session).expect("bus");
    assert_eq!(again.handle(), handle);
    assert_eq!(again.filter_count(), 0);
    assert_eq!(transport.ref_count(handle), Some(2));
}

#[test]
fn kind_mismatch_is_an_internal_error_and_returns_the_reference() {
    let (transport, runtime) = setup();
    let bus = runtime.bus_get(BusType::System).expect("bus");
    transport.retain(bus.handle()).expect("retain");

    let err = runtime.adopt_connection(bus.handle(), CloseOnFinalize::Unset).unwrap_err();
    assert!(err.is_fatal(), "{err}");
    assert!(matches!(err, BindError::InternalConsistency(_)));
    assert_eq!(transport.ref_count(bus.handle()), Some(1));
}

#[test]
fn rewrap_updates_close_flag_only_when_given() {
    let (transport, runtime) = setup();
    let _server = runtime.server_listen("unix:abstract=identity").expect("listen");
    let conn = runtime.connection_open("unix:abstract=identity").expect("open");
    assert!(conn.close_on_finalize());

    transport.retain(conn.handle()).expect("retain");
    let same = runtime.adopt_connection(conn.handle(), CloseOnFinalize::Unset).expect("wrap");
    assert!(same.ptr_eq(&conn));
    assert!(conn.close_on_finalize());

    transport.retain(conn.handle()).expect("retain");
    runtime.adopt_connection(conn.handle(), CloseOnFinalize::DontClose).expect("wrap");
    assert!(!conn.close_on_finalize());
    assert_eq!(transport.ref_count(conn.handle()), Some(1));
}

#[test]
fn dropped_wrappers_leave_the_registry() {
    let (transport, runtime) = setup();
    let msg = runtime.message_new(MessageType::MethodCall).expect("message");
    let handle = msg.handle();
    assert_eq!(runtime.tracked_handles(), 1);

    drop(msg);
    assert_eq!(runtime.tracked_handles(), 0);
    assert_eq!(transport.ref_count(handle), None);
    assert_eq!(runtime.sweep(), 0);
}
