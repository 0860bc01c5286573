use mcsnoopd::pdu::{self, PduBody};
use mcsnoopd::socket::{self, RawPacketSocket};
use mcsnoopd::interface;

use clap::Parser;

/// Prints the IGMP and MLD messages seen on an interface
#[derive(Debug, Clone, Parser)]
#[clap(name = "mcsnoop-dump", version, about)]
struct Cli {
    /// Interface to listen on
    interface: String,

    /// VLAN of untagged frames
    #[clap(long, default_value_t = 1)]
    pvid: u16,
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = Cli::parse();
    let if_index = interface::name_to_index(&args.interface)?;
    let socket = RawPacketSocket::new(if_index)?;
    socket.set_all_multicast()?;

    let mut buf = vec![0u8; 65536];
    loop {
        let info = socket.recv(&mut buf)?;
        let frame = &buf[..info.len];
        let (vid, frame) = match (info.vid, socket::strip_tag(frame)) {
            (Some(vid), _) => (vid, frame.to_vec()),
            (None, Some((vid, untagged))) => (vid, untagged),
            (None, None) => (args.pvid, frame.to_vec()),
        };
        if !socket::is_membership_frame(&frame) {
            continue;
        }

        let direction = if info.outgoing { "tx" } else { "rx" };
        print!("[{} {} vid {}]", args.interface, direction, vid);
        match pdu::parse(&frame) {
            Ok(pdu) => {
                print!(" {} -> {} {}", pdu.sip, pdu.dip, pdu.version());
                match &pdu.body {
                    PduBody::Query(query) => {
                        if query.is_general() {
                            print!(" general query");
                        } else {
                            print!(" query {}", query.group);
                        }
                        print!(" mrt {}ms qrv {} qqi {}s", query.max_resp_time_ms, query.qrv, query.qqi);
                        if query.s_flag {
                            print!(" S");
                        }
                        for source in &query.sources {
                            print!(" {}", source);
                        }
                    }

                    PduBody::Report(report) if report.is_leave => {
                        for record in &report.records {
                            print!(" leave {}", record.group);
                        }
                    }

                    PduBody::Report(report) => {
                        for record in &report.records {
                            let sources: Vec<String> = record.sources.iter().map(|source| source.to_string()).collect();
                            print!(" {}({}){{{}}}", record.record_type.name(), record.group, sources.join(","));
                        }
                        if report.skipped_records != 0 {
                            print!(" +{} skipped", report.skipped_records);
                        }
                    }
                }
            }
            Err(e) => {
                print!(" <{}>", e);
            }
        }
        println!();
    }
}
