use std::time::Instant;
use ethercycle::{
    EthernetSocket, Master, MasterConfig, MailboxConfig,
    AlState, RequestState,
    driver,
    };

const MAILBOX: MailboxConfig = MailboxConfig {
    write_offset: 0x1000,
    write_size: 512,
    read_offset: 0x1200,
    read_size: 512,
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();
    let other = |err: ethercycle::EthercatError| std::io::Error::new(std::io::ErrorKind::Other, err.to_string());

    let mut master = Master::new(EthernetSocket::new("eno1")?, MasterConfig::default());
    master.add_slave(0, 0x1001, Some(MAILBOX), Instant::now()).map_err(other)?;
    master.enable_tunnel(0).map_err(other)?;
    let switch = master.request_state(0, AlState::PreOperational).map_err(other)?;

    // broadcast ARP request, asking who has 192.168.0.1
    let mut frame = vec![0xff; 6];
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame.extend_from_slice(&[0x08, 0x06, 0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01, 192, 168, 0, 2]);
    frame.extend_from_slice(&[0, 0, 0, 0, 0, 0, 192, 168, 0, 1]);
    master.tunnel_send(0, frame).map_err(other)?;

    let mut replies = Vec::new();
    driver::run_until(&mut master, |master| {
        while let Some(reply) = master.tunnel_receive(0) {
            replies.push(reply);
        }
        master.cycles() > 5_000 || ! replies.is_empty()
    }).await?;

    println!("{:?}", master.take_state_request(switch).unwrap_or(RequestState::Busy));
    println!("{:?}", master.tunnel_stats(0));
    for reply in replies {
        println!("{:02x?}", reply);
    }
    Ok(())
}
