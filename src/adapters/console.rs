//! Terminal event sink.
//!
//! Renders [`AppEvent`]s as plain lines on stdout. This is the whole
//! "UI" of the hosting binary; a richer front end would implement
//! [`EventSink`] instead of this one.

use crate::app::events::AppEvent;
use crate::app::ports::EventSink;

pub struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn emit(&mut self, event: &AppEvent) {
        match event {
            AppEvent::Started { username, local_ip } => {
                println!("you are {username} at {local_ip}");
            }
            AppEvent::PeerListUpdated { active } => {
                println!("[{active} peer(s) active]");
            }
            AppEvent::MessageReceived { username, ip, content } => {
                println!("{username} ({ip}): {content}");
            }
            AppEvent::SendFailed { ip, reason } => {
                println!("Error sending to {ip}: {reason}");
            }
            AppEvent::NetworkBusy => {
                println!("Network busy. Please try again.");
            }
            AppEvent::SelfTestReport(report) => {
                println!(
                    "self-test: {} rounds, {} peers, {} started / {} queued / {} rejected",
                    report.rounds_completed,
                    report.peers_targeted,
                    report.messages_started,
                    report.messages_queued,
                    report.messages_rejected
                );
            }
            AppEvent::ShuttingDown => {
                println!("leaving...");
            }
        }
    }
}
