use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};

use zrtp::application::{ApplicationLayer, ProtocolEvent, SecurityEvent};
use zrtp::cache::{FileCache, SecretCache};
use zrtp::crypto_impl::DefaultCrypto;
use zrtp::profile::{LicenseMode, SignalingRole};
use zrtp::proto::RTP_HEADER_SIZE;
use zrtp::{Config, Context, PacketAction, StreamHandle, StreamState};

struct TestCrypto;
impl DefaultCrypto for TestCrypto {
    type SessionData = ();
}

struct TestApplication {
    time: Instant,
    name: &'static str,
    out: mpsc::SyncSender<Vec<u8>>,
    packet_success_rate: u32,
}

#[allow(unused)]
impl ApplicationLayer<TestCrypto> for &TestApplication {
    fn time(&mut self) -> i64 {
        self.time.elapsed().as_millis() as i64
    }

    fn send_packet(&mut self, stream: &StreamHandle<TestCrypto>, packet: &[u8]) -> bool {
        if OsRng.next_u32() <= self.packet_success_rate {
            self.out.try_send(packet.to_vec()).is_ok()
        } else {
            true
        }
    }

    fn on_protocol_event(&mut self, stream: &StreamHandle<TestCrypto>, event: ProtocolEvent) {
        println!("[{}] {:?}", self.name, event);
    }

    fn on_security_event(&mut self, stream: &StreamHandle<TestCrypto>, event: SecurityEvent) {
        println!("[{}] SECURITY {:?}", self.name, event);
    }

    #[cfg(feature = "logging")]
    fn event_log(&mut self, event: zrtp::LogEvent<TestCrypto>) {
        println!(">[{}] {:?}", self.name, event);
    }
}

fn rtp_packet(seq: u16, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(RTP_HEADER_SIZE + payload.len());
    p.extend_from_slice(&[0x80, 0x00]);
    p.extend_from_slice(&seq.to_be_bytes());
    p.extend_from_slice(&(seq as u32 * 160).to_be_bytes());
    p.extend_from_slice(&ssrc.to_be_bytes());
    p.extend_from_slice(payload);
    p
}

fn endpoint_main(
    run: &AtomicBool,
    secured: &AtomicBool,
    app: &TestApplication,
    license: LicenseMode,
    zid: [u8; 12],
    inbox: mpsc::Receiver<Vec<u8>>,
) {
    let mut config = Config::new(zid);
    config.license = license;
    config.cache = Some(Arc::new(FileCache::in_memory()) as Arc<dyn SecretCache>);
    let context = Context::<TestCrypto>::new(config, OsRng).unwrap();
    let session = context.session_init(None, SignalingRole::Unknown, ()).unwrap();
    let stream = context.stream_attach(&session).unwrap();
    let ssrc = OsRng.next_u32();
    context.stream_start(app, &stream, ssrc).unwrap();

    let payload = [0x55u8; 160];
    let mut seq = 0u16;
    let mut received = 0u64;
    let mut reported = false;
    let mut next_service = context.next_service_time();

    while run.load(Ordering::Relaxed) {
        if let Ok(mut pkt) = inbox.recv_timeout(Duration::from_millis(5)) {
            match context.process_srtp(app, &stream, &mut pkt) {
                Ok(PacketAction::Forward) => {
                    if !zrtp::is_zrtp_packet(&pkt) && pkt[RTP_HEADER_SIZE..] == payload[..] {
                        received += 1;
                    }
                }
                Ok(PacketAction::Drop) => {}
                Err(e) => println!("[{}] ERROR {:?}", app.name, e),
            }
        }

        if stream.state() == StreamState::Secure {
            if !reported {
                reported = true;
                secured.store(true, Ordering::SeqCst);
                let info = context.session_get(&session);
                println!(
                    "[{}] secure after {}ms, SAS \"{} {}\" using {:?}/{:?}",
                    app.name,
                    app.time.elapsed().as_millis(),
                    info.sas1,
                    info.sas2,
                    info.pk,
                    info.cipher
                );
            }
            seq = seq.wrapping_add(1);
            let mut media = rtp_packet(seq, ssrc, &payload);
            if let Ok(PacketAction::Forward) = context.process_rtp(&stream, &mut media) {
                let _ = app.out.try_send(media);
            }
        }

        let current_time = app.time.elapsed().as_millis() as i64;
        if current_time >= next_service {
            next_service = context.service(app).min(current_time + 100);
        }
    }
    println!("[{}] received {} media packets", app.name, received);
}

fn core(time: u64, packet_success_rate: u32) -> bool {
    let run = &AtomicBool::new(true);
    let alice_secure = &AtomicBool::new(false);
    let bob_secure = &AtomicBool::new(false);

    let (alice_out, bob_in) = mpsc::sync_channel::<Vec<u8>>(256);
    let (bob_out, alice_in) = mpsc::sync_channel::<Vec<u8>>(256);

    thread::scope(|ts| {
        ts.spawn(move || {
            let app = TestApplication { time: Instant::now(), name: "alice", out: alice_out, packet_success_rate };
            endpoint_main(run, alice_secure, &app, LicenseMode::Active, [0xa1; 12], alice_in)
        });
        ts.spawn(move || {
            let app = TestApplication { time: Instant::now(), name: "bob", out: bob_out, packet_success_rate };
            endpoint_main(run, bob_secure, &app, LicenseMode::Active, [0xb0; 12], bob_in)
        });

        thread::sleep(Duration::from_secs(time));

        run.store(false, Ordering::SeqCst);
        println!("finished");
    });
    alice_secure.load(Ordering::SeqCst) && bob_secure.load(Ordering::SeqCst)
}

fn main() {
    let args = std::env::args();
    let packet_success_rate = if args.len() <= 1 {
        u32::MAX
    } else {
        ((u32::MAX as f64) * args.last().and_then(|a| a.parse::<f64>().ok()).unwrap_or(1.0)) as u32
    };

    core(10, packet_success_rate);
}

#[test]
fn test_main() {
    assert!(core(3, u32::MAX / 10 * 9));
}
