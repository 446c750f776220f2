/// Example moving a buffer between two transfer engines over an in-memory link
///
/// Each side runs a SignalingHost; the main loop plays the controller and
/// carries L2CAP frames from one host to the other.
///
/// Run with `RUST_LOG=debug` (or `trace` for frame dumps) to follow along.
use l2xfer::*;
use std::sync::{Arc, Mutex};

const LINK: ConnectionHandle = ConnectionHandle(0);
const LENGTH: u32 = 4096;

/// Serves an in-memory file
struct FileSource {
    data: Vec<u8>,
}

impl Transmitter for FileSource {
    fn on_transmit(&mut self, _id: TransferId, offset: u32, size: u32) -> &[u8] {
        let start = offset as usize;
        &self.data[start..start + size as usize]
    }
}

/// Collects received bytes, topping credit up every few segments
#[derive(Default)]
struct FileSink {
    data: Vec<u8>,
    segments: u32,
    result: Option<TransferResult<()>>,
}

impl Receiver for FileSink {
    fn on_receive(&mut self, _id: TransferId, _offset: u32, data: &[u8]) -> u16 {
        self.data.extend_from_slice(data);
        self.segments += 1;
        if self.segments % 4 == 0 {
            4
        } else {
            0
        }
    }
}

impl Finisher for FileSink {
    fn on_open(&mut self, id: TransferId) {
        println!("Receiver: {} open", id);
    }

    fn on_finish(&mut self, id: TransferId, result: TransferResult<()>) {
        println!("Receiver: {} finished: {:?}", id, result);
        self.result = Some(result);
    }
}

/// Prints the sender's outcome
struct Reporter;

impl Finisher for Reporter {
    fn on_finish(&mut self, id: TransferId, result: TransferResult<()>) {
        println!("Sender: {} finished: {:?}", id, result);
    }
}

/// Carry every pending frame from one side to the other
fn deliver(from: &TransferEngine<SignalingHost>, to: &TransferEngine<SignalingHost>) -> Result<usize, TransferError> {
    let frames = from.stack().take_outbound();
    for frame in &frames {
        if let Some(event) = to.stack().handle_frame(frame.connection, &frame.bytes)? {
            to.on_bt_event(&event);
        }
    }
    Ok(frames.len())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    println!("L2CAP Loopback Transfer Example");
    println!("-------------------------------");

    let sender = TransferEngine::new(SignalingHost::new());
    let receiver = TransferEngine::with_config(
        SignalingHost::new(),
        EngineConfig {
            default_credit: 4,
            ..Default::default()
        },
    );

    let spsm = l2cap::obtain_dynamic_spsm();
    let payload: Vec<u8> = (0..LENGTH).map(|i| (i % 251) as u8).collect();
    let sink = Arc::new(Mutex::new(FileSink::default()));

    let incoming = receiver.start_transfer(
        Transfer::receiver(LINK, LENGTH)
            .with_spsm(spsm)
            .with_receiver(sink.clone())
            .with_finisher(sink.clone()),
        false,
    )?;
    println!("Receiver: {} waiting on {}", incoming, spsm);

    let outgoing = sender.start_transfer(
        Transfer::transmitter(LINK, LENGTH)
            .with_spsm(spsm)
            .with_max_pdu(180)
            .with_transmitter(Arc::new(Mutex::new(FileSource { data: payload.clone() })))
            .with_finisher(Arc::new(Mutex::new(Reporter))),
        true,
    )?;
    println!("Sender: {} queued, {} bytes", outgoing, LENGTH);

    let mut ticks = 0;
    loop {
        sender.process_action();
        receiver.process_action();
        ticks += 1;

        if let Some(transfer) = sender.transfer(outgoing).filter(|_| sender.check_progress(outgoing)) {
            println!(
                "tick {:3}: sent {:4}/{} bytes, credit {}",
                ticks, transfer.data_offset, transfer.data_length, transfer.credit
            );
        }

        let moved = deliver(&sender, &receiver)? + deliver(&receiver, &sender)?;
        if moved == 0 && sender.is_ok_to_sleep() && receiver.is_ok_to_sleep() {
            break;
        }
    }

    let sink = sink.lock().map_err(|_| "receiver hook poisoned")?;
    println!();
    println!("Finished after {} ticks", ticks);
    println!("Sender:   {:?}", sender.stats());
    println!("Receiver: {:?}", receiver.stats());
    println!(
        "Payload {}",
        if sink.data == payload { "intact" } else { "corrupted" }
    );

    match &sink.result {
        Some(Ok(())) => Ok(()),
        Some(Err(err)) => Err(err.clone().into()),
        None => Err("receiver never finished".into()),
    }
}
