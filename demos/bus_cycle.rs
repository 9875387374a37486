use std::time::Instant;
use ethercycle::{
    EthernetSocket, Master, MasterConfig, MailboxConfig,
    AlState, RequestState,
    driver,
    };

/// mailbox layout commonly found on small slaves
const MAILBOX: MailboxConfig = MailboxConfig {
    write_offset: 0x1000,
    write_size: 128,
    read_offset: 0x1080,
    read_size: 128,
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    driver::prioritize();

    let mut master = Master::new(EthernetSocket::new("eno1")?, MasterConfig::default());
    // slaves are expected addressed 0x1001, 0x1002 ... in ring order
    for position in 0 .. 2 {
        master.add_slave(position, 0x1001 + position, Some(MAILBOX), Instant::now())
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
    }

    let requests = (0 .. 2)
        .filter_map(|position| master.request_state(position, AlState::Operational).ok())
        .collect::<Vec<_>>();
    let cycles = driver::run_until(&mut master, |master| requests.iter()
            .all(|request| master.state_request(*request).map_or(true, RequestState::is_terminal))
        ).await?;

    println!("{} cycles", cycles);
    for request in requests {
        println!("{:?}", master.take_state_request(request));
    }
    for status in master.statuses() {
        println!("{}", status);
    }
    println!("{:?}", master.transport_stats());
    Ok(())
}
