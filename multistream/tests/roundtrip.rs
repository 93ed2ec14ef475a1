use std::sync::Arc;

use multistream::{Command, Config, Device, Error, Priority, Session};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn device() -> Arc<Device> {
    init_logging();
    Arc::new(
        Device::new(Config {
            units: 4,
            ..Config::default()
        })
        .unwrap(),
    )
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn blocking(session: &Session, priority: Priority) {
    session.control(Command::SetPriority(priority)).unwrap();
    session.control(Command::SetBlockingTimeout(500)).unwrap();
}

#[test]
fn test_round_trip_spans_chunks() {
    let device = device();
    let session = device.open(0).unwrap();

    let data = pattern(3 * 4096 + 100);
    assert_eq!(session.write(&data).unwrap(), data.len());
    assert_eq!(session.unit().stats().high.chunks, 4);
    assert_eq!(session.unit().stats().high.buffered_bytes, data.len());

    assert_eq!(session.read(data.len()).unwrap(), data);
    assert_eq!(session.unit().stats().high.buffered_bytes, 0);
}

#[test]
fn test_round_trip_in_small_pieces() {
    let device = device();
    let session = device.open(1).unwrap();

    let data = pattern(10_000);
    for piece in data.chunks(333) {
        assert_eq!(session.write(piece).unwrap(), piece.len());
    }
    let mut out = Vec::new();
    loop {
        let got = session.read(1000).unwrap();
        if got.is_empty() {
            break;
        }
        out.extend(got);
    }
    assert_eq!(out, data);
}

#[test]
fn test_low_priority_round_trip() {
    let device = device();
    let session = device.open(0).unwrap();
    blocking(&session, Priority::Low);

    let data = pattern(9000);
    assert_eq!(session.write(&data).unwrap(), 9000);
    // Space is taken at once, even if the bytes are not readable yet
    assert_eq!(session.unit().stats().low.free_bytes, 20480 - 9000);

    device.flush_deferred();
    let stats = session.unit().stats().low;
    assert_eq!(stats.buffered_bytes, 9000);
    assert_eq!(stats.deferred_pending, 0);
    assert_eq!(session.read(20480).unwrap(), data);
}

#[test]
fn test_write_is_clipped_to_capacity() {
    let device = device();
    let session = device.open(0).unwrap();

    assert_eq!(session.write(&pattern(25_000)).unwrap(), 20480);
    assert_eq!(session.write(b"more"), Err(Error::NoSpace));

    let stats = session.unit().stats().high;
    assert_eq!(stats.buffered_bytes, 20480);
    assert_eq!(stats.free_bytes, 0);
    assert_eq!(stats.chunks, 5);
    assert_eq!(session.read(30_000).unwrap(), pattern(20480));
}

#[test]
fn test_partial_write_on_nearly_full_flow() {
    let device = device();
    let session = device.open(0).unwrap();

    session.write(&pattern(20_000)).unwrap();
    assert_eq!(session.write(&[1; 1000]).unwrap(), 480);
}

#[test]
fn test_levels_always_sum_to_capacity() {
    let device = device();
    let session = device.open(2).unwrap();
    blocking(&session, Priority::High);

    let check = |session: &Session| {
        let stats = session.unit().stats();
        for priority in Priority::ALL {
            let flow = stats.flow(priority);
            assert_eq!(flow.buffered_bytes + flow.free_bytes, 20480, "{priority}");
        }
    };

    for (write, read) in [(5000, 100), (9000, 12_000), (20_000, 3), (1, 20_480)] {
        session.write(&pattern(write)).unwrap();
        check(&session);
        session.read(read).unwrap();
        check(&session);
    }

    session.control(Command::SetPriority(Priority::Low)).unwrap();
    session.write(&pattern(7000)).unwrap();
    device.flush_deferred();
    check(&session);
    session.read(6000).unwrap();
    check(&session);
}

#[test]
fn test_chunks_reclaimed_to_baseline() {
    let device = device();
    let session = device.open(3).unwrap();
    let baseline = session.unit().stats().high.chunks;
    assert_eq!(baseline, 1);

    for _ in 0..5 {
        let data = pattern(5 * 4096);
        session.write(&data).unwrap();
        assert_eq!(session.unit().stats().high.chunks, 5);
        assert_eq!(session.read(data.len()).unwrap(), data);
        assert_eq!(session.unit().stats().high.chunks, baseline);
    }
}

#[test]
fn test_read_of_empty_flow() {
    let device = device();
    let session = device.open(0).unwrap();
    assert_eq!(session.read(100).unwrap(), Vec::<u8>::new());

    session.control(Command::SetBlockingTimeout(2)).unwrap();
    assert_eq!(session.read(100), Err(Error::NoData));
}

#[test]
fn test_zero_length_operations() {
    let device = device();
    let session = device.open(0).unwrap();
    assert_eq!(session.write(&[]).unwrap(), 0);
    session.write(b"abc").unwrap();
    assert!(session.read(0).unwrap().is_empty());
    assert_eq!(session.read(10).unwrap(), b"abc");
}

#[test]
fn test_priorities_are_separate_streams() {
    let device = device();
    let high = device.open(0).unwrap();
    let low = device.open(0).unwrap();
    blocking(&low, Priority::Low);

    high.write(b"high data").unwrap();
    low.write(b"low data").unwrap();
    device.flush_deferred();

    assert_eq!(low.read(100).unwrap(), b"low data");
    assert_eq!(high.read(100).unwrap(), b"high data");
}

#[test]
fn test_sessions_on_a_unit_share_its_flows() {
    let device = device();
    let writer = device.open(1).unwrap();
    let reader = device.open(1).unwrap();
    let other = device.open(2).unwrap();
    assert_ne!(writer.id(), reader.id());

    writer.write(b"shared").unwrap();
    assert!(other.read(100).unwrap().is_empty());
    assert_eq!(reader.read(100).unwrap(), b"shared");
}

#[test]
fn test_disabled_unit_rejects_io() {
    let device = device();
    let session = device.open(0).unwrap();
    let bystander = device.open(0).unwrap();
    session.write(b"kept").unwrap();

    session.ioctl(Command::SET_OPENCLOSE, 0).unwrap();
    assert!(!session.unit().stats().enabled);
    assert_eq!(session.write(b"x"), Err(Error::UnitDisabled(0)));
    assert_eq!(bystander.read(10), Err(Error::UnitDisabled(0)));
    assert_eq!(device.open(0).unwrap_err(), Error::UnitDisabled(0));

    // Control still works on a disabled unit
    bystander.ioctl(Command::SET_OPENCLOSE, 1).unwrap();
    assert_eq!(session.read(10).unwrap(), b"kept");
}

#[test]
fn test_byte_counters() {
    let device = device();
    let session = device.open(0).unwrap();
    session.write(&pattern(300)).unwrap();
    session.read(120).unwrap();

    let stats = session.unit().stats().high;
    assert_eq!(stats.bytes_written, 300);
    assert_eq!(stats.bytes_read, 120);
    assert_eq!(stats.buffered_bytes, 180);
}

#[test]
fn test_invalid_command() {
    let device = device();
    let session = device.open(0).unwrap();
    assert_eq!(
        session.ioctl(9, 0),
        Err(Error::InvalidCommand { code: 9, param: 0 })
    );
    assert_eq!(
        session.ioctl(Command::SET_PRIO, 5),
        Err(Error::InvalidCommand { code: 1, param: 5 })
    );
    assert_eq!(session.attrs().priority, Priority::High);
}
