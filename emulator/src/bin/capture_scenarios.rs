use std::io;
use std::path::Path;

use charge_core::hv::ProtocolKind;
use log::info;

#[allow(dead_code)]
#[path = "../session.rs"]
mod session;
#[allow(dead_code)]
#[path = "../sim.rs"]
mod sim;
#[allow(dead_code)]
#[path = "../transcript.rs"]
mod transcript;

use session::Session;
use sim::Adapter;
use transcript::TranscriptLogger;

const TRANSCRIPT_DIR: &str = "transcripts";

struct Scenario {
    name: &'static str,
    title: &'static str,
    protocol: ProtocolKind,
    adapter: Adapter,
    script: &'static [&'static str],
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "water-latch",
        title: "Wet connector latches, promotes, then dries out",
        protocol: ProtocolKind::Afc,
        adapter: Adapter::Afc,
        script: &[
            "wet",
            "attach dcp",
            "status",
            "advance 30000",
            "dry",
            "advance 10000",
            "advance 1000",
            "status",
        ],
    },
    Scenario {
        name: "afc-unanswered",
        title: "Plain charger never answers AFC pings",
        protocol: ProtocolKind::Afc,
        adapter: Adapter::Plain,
        script: &["attach dcp", "advance 3000", "status", "advance 5000"],
    },
    Scenario {
        name: "qc-stuck",
        title: "QC charger stuck in the settling band",
        protocol: ProtocolKind::Qc,
        adapter: Adapter::QcStuck,
        script: &["attach dcp", "advance 2000", "status", "advance 30000", "status"],
    },
    Scenario {
        name: "detach-mid-handshake",
        title: "Detach during the AFC handshake, then re-attach",
        protocol: ProtocolKind::Afc,
        adapter: Adapter::Plain,
        script: &[
            "attach dcp",
            "advance 400",
            "detach",
            "status",
            "adapter afc",
            "attach dcp",
            "advance 1000",
            "status",
        ],
    },
    Scenario {
        name: "afc-step-down",
        title: "AFC charger at 9 V steps back down on request",
        protocol: ProtocolKind::Afc,
        adapter: Adapter::Afc,
        script: &[
            "attach dcp",
            "advance 1000",
            "status",
            "voltage 5",
            "advance 1000",
            "status",
        ],
    },
];

fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    for scenario in SCENARIOS {
        record(scenario)?;
    }
    Ok(())
}

fn record(scenario: &Scenario) -> io::Result<()> {
    let path = Path::new(TRANSCRIPT_DIR).join(format!("{}.log", scenario.name));
    let transcript = TranscriptLogger::create(&path, scenario.title)?;
    let mut session = Session::new(scenario.protocol, scenario.adapter)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?
        .with_transcript(transcript);

    for line in scenario.script {
        session.handle_command(line)?;
    }

    let status = session.port().status();
    info!(
        "capture: {} -> {} (hv {}, {} register writes, ends {})",
        scenario.name,
        path.display(),
        status.hv.state,
        session.chip().register_writes(),
        session.now()
    );
    Ok(())
}
