mod common;

use std::time::{Duration, Instant};
use ethercycle::{
    AlState, EthercatError, MasterConfig, RequestState,
    MailboxType, MailboxReply, MailboxReject, Operation,
    mailbox::MailboxError,
    coe::SdoAbortCode,
    };
use common::{AlBehaviour, MAILBOX, CYCLE, master, run};


#[test]
fn exchange_with_echo() {
    common::init_logger();
    let (mut master, bus) = master(MasterConfig::default());
    bus.add_slave(0x1001, AlBehaviour::Follow, Some(MAILBOX), Some(common::echo()));
    let mut now = Instant::now();
    master.add_slave(0, 0x1001, Some(MAILBOX), now).unwrap();

    let exchange = master.submit(0, Operation::Exchange {ty: MailboxType::Can, data: vec![0x10, 0x20, 0x30]}).unwrap();
    let write = master.submit(0, Operation::Write {ty: MailboxType::Can, data: vec![1]}).unwrap();
    assert_eq!(master.status(0).unwrap().mailbox_requests, 2);
    run(&mut master, &mut now, 10);

    assert_eq!(master.take(exchange), Some(RequestState::Completed(MailboxReply::Data(vec![0x10, 0x20, 0x30]))));
    assert_eq!(master.take(write), Some(RequestState::Completed(MailboxReply::Empty)));
    assert_eq!(bus.mailbox_writes(0x1001), 2);
    assert_eq!(master.status(0).unwrap().mailbox_requests, 0);

    // the echo of the write is still waiting in the slave mailbox
    let fetch = master.submit(0, Operation::Fetch {ty: MailboxType::Can}).unwrap();
    run(&mut master, &mut now, 5);
    assert_eq!(master.take(fetch), Some(RequestState::Completed(MailboxReply::Data(vec![1]))));
    let fetch = master.submit(0, Operation::Fetch {ty: MailboxType::Can}).unwrap();
    run(&mut master, &mut now, 5);
    assert_eq!(master.take(fetch), Some(RequestState::Completed(MailboxReply::Empty)));
}

#[test]
fn requests_on_one_slave_are_serialized() {
    common::init_logger();
    let (mut master, bus) = master(MasterConfig::default());
    bus.add_slave(0x1001, AlBehaviour::Follow, Some(MAILBOX), None);
    let mut now = Instant::now();
    master.add_slave(0, 0x1001, Some(MAILBOX), now).unwrap();

    let first = master.submit(0, Operation::Read {ty: MailboxType::Can}).unwrap();
    let second = master.submit(0, Operation::Read {ty: MailboxType::Can}).unwrap();
    for _ in 0 .. 10 {
        master.cycle(now);
        now += CYCLE;
        assert_eq!(master.poll(first), Some(&RequestState::Busy));
        assert_eq!(master.poll(second), Some(&RequestState::Queued));
    }

    bus.push_message(0x1001, 0x3, &[1, 2]);
    let mut overlap = false;
    for _ in 0 .. 10 {
        master.cycle(now);
        now += CYCLE;
        if ! master.poll(first).unwrap().is_terminal() {
            overlap |= master.poll(second) != Some(&RequestState::Queued);
        }
    }
    assert!(! overlap);
    assert_eq!(master.take(first), Some(RequestState::Completed(MailboxReply::Data(vec![1, 2]))));
    assert_eq!(master.poll(second), Some(&RequestState::Busy));

    bus.push_message(0x1001, 0x3, &[3]);
    run(&mut master, &mut now, 5);
    assert_eq!(master.take(second), Some(RequestState::Completed(MailboxReply::Data(vec![3]))));
}

#[test]
fn distinct_slaves_are_busy_together() {
    common::init_logger();
    let (mut master, bus) = master(MasterConfig::default());
    bus.add_slave(0x1001, AlBehaviour::Follow, Some(MAILBOX), None);
    bus.add_slave(0x1002, AlBehaviour::Follow, Some(MAILBOX), None);
    let mut now = Instant::now();
    master.add_slave(0, 0x1001, Some(MAILBOX), now).unwrap();
    master.add_slave(1, 0x1002, Some(MAILBOX), now).unwrap();

    let a = master.submit(0, Operation::Read {ty: MailboxType::Can}).unwrap();
    let b = master.submit(1, Operation::Read {ty: MailboxType::Can}).unwrap();
    run(&mut master, &mut now, 2);
    assert_eq!(master.poll(a), Some(&RequestState::Busy));
    assert_eq!(master.poll(b), Some(&RequestState::Busy));

    bus.push_message(0x1002, 0x3, &[2]);
    run(&mut master, &mut now, 4);
    assert_eq!(master.poll(a), Some(&RequestState::Busy));
    assert_eq!(master.take(b), Some(RequestState::Completed(MailboxReply::Data(vec![2]))));
}

#[test]
fn dictionary_waits_for_configuration_delay() {
    common::init_logger();
    let delay = Duration::from_millis(10);
    let (mut master, bus) = master(MasterConfig {
        sdo_dictionary_delay: delay,
        .. Default::default()
    });
    bus.add_slave(0x1001, AlBehaviour::Follow, Some(MAILBOX), Some(common::dictionary(&[0x1000, 0x1018, 0x6040, 0x6041])));
    let mut now = Instant::now();
    master.add_slave(0, 0x1001, Some(MAILBOX), now).unwrap();

    let dictionary = master.fetch_dictionary(0).unwrap();
    let exchange = master.submit(0, Operation::Exchange {ty: MailboxType::Can, data: vec![7]}).unwrap();
    let switch = master.request_state(0, AlState::PreOperational).unwrap();

    let mut preop = None;
    for _ in 0 .. 40 {
        master.cycle(now);
        if preop.is_none() && master.state_request(switch) == Some(&RequestState::Completed(AlState::PreOperational)) {
            preop = Some(now);
        }
        if preop.map_or(true, |since| now < since + delay) {
            assert_eq!(master.poll(dictionary), Some(&RequestState::Queued));
        }
        now += CYCLE;
    }
    assert!(preop.is_some());
    // the exchange submitted later was allowed to pass the deferred fetch
    assert_eq!(master.take(exchange), Some(RequestState::Completed(MailboxReply::Data(vec![7]))));
    assert_eq!(master.take(dictionary), Some(RequestState::Completed(MailboxReply::Dictionary(vec![0x1000, 0x1018, 0x6040, 0x6041]))));
}

#[test]
fn slave_errors_are_passed_through() {
    common::init_logger();
    let (mut master, bus) = master(MasterConfig {
        sdo_dictionary_delay: Duration::ZERO,
        .. Default::default()
    });
    bus.add_slave(0x1001, AlBehaviour::Follow, Some(MAILBOX), Some(Box::new(|ty: u8, _: &[u8]| match ty {
        // SDO information error
        0x3 => vec![(0x3, vec![0x00, 0x80, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x06])],
        // mailbox exception
        _ => vec![(0x0, vec![0x01, 0x00, 0x04, 0x00])],
    })));
    let mut now = Instant::now();
    master.add_slave(0, 0x1001, Some(MAILBOX), now).unwrap();

    let exchange = master.submit(0, Operation::Exchange {ty: MailboxType::File, data: vec![0]}).unwrap();
    let switch = master.request_state(0, AlState::PreOperational).unwrap();
    run(&mut master, &mut now, 6);
    assert_eq!(
        master.take(exchange),
        Some(RequestState::Error(EthercatError::ProtocolReject(MailboxReject::Mailbox(MailboxError::ServiceNotSupported)))),
        );
    assert!(master.take_state_request(switch).is_some());

    let dictionary = master.fetch_dictionary(0).unwrap();
    run(&mut master, &mut now, 6);
    assert_eq!(
        master.take(dictionary),
        Some(RequestState::Error(EthercatError::ProtocolReject(MailboxReject::Sdo(SdoAbortCode(0x0602_0000))))),
        );
}

#[test]
fn full_mailbox_is_written_again() {
    common::init_logger();
    let (mut master, bus) = master(MasterConfig {
        mailbox_timeout: Duration::from_millis(10),
        .. Default::default()
    });
    bus.add_slave(0x1001, AlBehaviour::Follow, Some(MAILBOX), None);
    bus.set_accept(0x1001, false);
    let mut now = Instant::now();
    master.add_slave(0, 0x1001, Some(MAILBOX), now).unwrap();

    let write = master.submit(0, Operation::Write {ty: MailboxType::Can, data: vec![1, 2]}).unwrap();
    run(&mut master, &mut now, 4);
    assert_eq!(master.poll(write), Some(&RequestState::Busy));
    bus.set_accept(0x1001, true);
    run(&mut master, &mut now, 2);
    assert_eq!(master.take(write), Some(RequestState::Completed(MailboxReply::Empty)));
    assert_eq!(bus.mailbox_writes(0x1001), 1);

    bus.set_accept(0x1001, false);
    let write = master.submit(0, Operation::Write {ty: MailboxType::Can, data: vec![3]}).unwrap();
    run(&mut master, &mut now, 15);
    assert_eq!(master.take(write), Some(RequestState::Error(EthercatError::Timeout("slave mailbox stayed full"))));
}

#[test]
fn lost_datagrams_fail_the_whole_request() {
    common::init_logger();
    let (mut master, bus) = master(MasterConfig::default());
    bus.add_slave(0x1001, AlBehaviour::Follow, Some(MAILBOX), Some(common::echo()));
    let mut now = Instant::now();
    master.add_slave(0, 0x1001, Some(MAILBOX), now).unwrap();

    bus.set_drop(true);
    let exchange = master.submit(0, Operation::Exchange {ty: MailboxType::Can, data: vec![1, 2, 3]}).unwrap();
    let write = master.submit(0, Operation::Write {ty: MailboxType::Can, data: vec![4]}).unwrap();
    let mut cycles = 0;
    while ! master.poll(exchange).unwrap().is_terminal() && cycles < 10 {
        master.cycle(now);
        now += CYCLE;
        cycles += 1;
    }
    // one transmission per cycle, up to the retry ceiling
    assert_eq!(cycles, 4);
    assert_eq!(bus.frames(), 3);
    assert_eq!(master.take(exchange), Some(RequestState::Error(EthercatError::RetryExhausted)));
    assert_eq!(master.transport_stats().failures, 1);

    // the next request of the slave starts once the failed one is retired
    bus.set_drop(false);
    run(&mut master, &mut now, 10);
    assert_eq!(master.take(write), Some(RequestState::Completed(MailboxReply::Empty)));
    assert_eq!(bus.mailbox_writes(0x1001), 1);
}

#[test]
fn cancellation() {
    common::init_logger();
    let (mut master, bus) = master(MasterConfig::default());
    bus.add_slave(0x1001, AlBehaviour::Follow, Some(MAILBOX), None);
    let mut now = Instant::now();
    master.add_slave(0, 0x1001, Some(MAILBOX), now).unwrap();
    assert!(matches!(
        master.submit(0, Operation::Write {ty: MailboxType::Can, data: vec![0; 123]}),
        Err(EthercatError::OversizedPayload {size: 123, max: 122}),
        ));
    assert!(master.submit(1, Operation::Read {ty: MailboxType::Can}).is_err());

    let busy = master.submit(0, Operation::Read {ty: MailboxType::Can}).unwrap();
    let queued = master.submit(0, Operation::Read {ty: MailboxType::Can}).unwrap();
    run(&mut master, &mut now, 2);
    assert!(master.cancel(queued));
    assert_eq!(master.poll(queued), Some(&RequestState::Error(EthercatError::Cancelled)));

    // a busy request finishes its exchange, then its result is discarded
    assert!(! master.cancel(busy));
    assert_eq!(master.poll(busy), Some(&RequestState::Busy));
    bus.push_message(0x1001, 0x3, &[9]);
    run(&mut master, &mut now, 4);
    assert_eq!(master.take(busy), Some(RequestState::Error(EthercatError::Cancelled)));
}
