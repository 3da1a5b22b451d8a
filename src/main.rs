use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

use sb_analytics::adapter::StdoutSink;
use sb_analytics::logging::{log, obj, v_num, v_str, Domain, Level};
use sb_analytics::{Analytics, Config, UserData};

/// One stdin line.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Command {
    Page {
        url: String,
        #[serde(default)]
        referrer: String,
    },
    Track {
        event: String,
        #[serde(default)]
        properties: Map<String, Value>,
        #[serde(default)]
        user: Option<UserData>,
    },
    Variant {
        experiment: String,
    },
    Exposure {
        experiment: String,
    },
    Convert {
        experiment: String,
        goal: String,
    },
    Force {
        experiment: String,
        variant: String,
    },
    Reset {
        experiment: String,
    },
    Assignments,
    Unload,
}

fn print_line(value: Value) {
    println!("{}", value);
}

fn run(analytics: &mut Analytics, cmd: Command) -> bool {
    match cmd {
        Command::Page { url, referrer } => {
            analytics.page(&url, &referrer);
            let source = analytics.traffic_source();
            print_line(json!({"kind": "TrafficSource", "label": source.label(), "campaign": source.campaign}));
        }
        Command::Track { event, properties, user } => {
            analytics.track_with_user(&event, properties, user);
        }
        Command::Variant { experiment } => {
            let variant = analytics.get_variant(&experiment);
            print_line(json!({"kind": "Variant", "experiment": experiment, "variant": variant.map(|v| v.id)}));
        }
        Command::Exposure { experiment } => {
            analytics.track_exposure(&experiment);
        }
        Command::Convert { experiment, goal } => {
            analytics.track_experiment_conversion(&experiment, &goal);
        }
        Command::Force { experiment, variant } => {
            let ok = analytics.experiments().force_variant(&experiment, &variant);
            print_line(json!({"kind": "Forced", "experiment": experiment, "variant": variant, "ok": ok}));
        }
        Command::Reset { experiment } => {
            analytics.experiments().reset_assignment(&experiment);
        }
        Command::Assignments => {
            let assignments = analytics.experiments().get_all_assignments();
            print_line(json!({"kind": "Assignments", "assignments": assignments}));
        }
        Command::Unload => return false,
    }
    for header in analytics.take_set_cookie_headers() {
        print_line(json!({"kind": "SetCookie", "header": header}));
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    if cfg.is_production() && cfg.debug {
        log(
            Level::Warn,
            Domain::System,
            "debug_in_production",
            obj(&[("msg", v_str("console mirror is on"))]),
        );
    }
    let mut analytics = Analytics::from_config(cfg, Arc::new(StdoutSink))?;
    analytics.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let cmd = match serde_json::from_str::<Command>(&line) {
            Ok(cmd) => cmd,
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::System,
                    "bad_input",
                    obj(&[("line", v_num(line_no as f64)), ("msg", v_str(&err.to_string()))]),
                );
                continue;
            }
        };
        if !run(&mut analytics, cmd) {
            break;
        }
    }

    let beaconed = analytics.on_unload();
    log(
        Level::Info,
        Domain::System,
        "shutdown",
        obj(&[("beaconed", v_num(beaconed as f64))]),
    );
    // let the beacon POST get out before the runtime drops
    if beaconed > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
    Ok(())
}
