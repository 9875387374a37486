/*!
    fixed rate execution of the master cycles.

    The master itself never waits on anything, so something must call [Master::cycle] at a fixed rate. The functions here do it with a timerfd interval, which is far more accurate than the usual tokio timers.
*/

use std::{
    io,
    time::Instant,
    sync::Arc,
    };
use futures::stream::StreamExt;
use log::warn;

use crate::master::Master;


/// run cycles of the given master forever, at the rate set in its config
pub async fn run(master: &mut Master) -> io::Result<()> {
    run_until(master, |_| false).await.map(|_| ())
}

/**
    run cycles of the given master at the rate set in its config, until `done` returns true

    `done` is called after each cycle, this is the place to inspect requests and submit new ones. Returns the number of cycles run.
*/
pub async fn run_until<F>(master: &mut Master, mut done: F) -> io::Result<u64>
where F: FnMut(&mut Master) -> bool
{
    let mut interval = tokio_timerfd::Interval::new_interval(master.config().cycle_period)?;
    let mut cycles = 0;
    while let Some(tick) = interval.next().await {
        tick?;
        master.cycle(Instant::now());
        cycles += 1;
        if done(master)
            {break}
    }
    Ok(cycles)
}

/**
    run cycles of a master shared with other tasks, forever

    The master is only locked during a cycle, the other tasks can submit requests and poll them in between.
*/
pub async fn run_shared(master: Arc<tokio::sync::Mutex<Master>>) -> io::Result<()> {
    let period = master.lock().await.config().cycle_period;
    let mut interval = tokio_timerfd::Interval::new_interval(period)?;
    while let Some(tick) = interval.next().await {
        tick?;
        master.lock().await.cycle(Instant::now());
    }
    Ok(())
}

/**
    give the current thread and process realtime priority, so the cycles are not delayed by other programs

    This generally requires privileges, failures are only reported in the log and return false.
*/
pub fn prioritize() -> bool {
    let mut success = true;
    #[cfg(target_os = "linux")]
    {
        if let Err(err) = thread_priority::set_thread_priority_and_policy(
                thread_priority::thread_native_id(),
                thread_priority::ThreadPriority::Max,
                thread_priority::ThreadSchedulePolicy::Realtime(thread_priority::RealtimeThreadSchedulePolicy::Fifo),
                ) {
            warn!("cannot set realtime thread priority: {:?}", err);
            success = false;
        }
        if let Err(err) = ioprio::set_priority(
                ioprio::Target::Process(ioprio::Pid::this()),
                ioprio::Priority::new(ioprio::Class::Realtime(ioprio::RtPriorityLevel::highest())),
                ) {
            warn!("cannot set realtime io priority: {}", err);
            success = false;
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        warn!("realtime priority is only supported on linux");
        success = false;
    }
    success
}
