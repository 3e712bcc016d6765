use remaster_rs::client::Client;
use remaster_rs::model::{DiffId, OpId};

const USAGE: &str = "usage: remaster_client <addr> <command>
commands:
  notify <entity> <source> <foreign-id>
  conflicts
  resolve <diff-id> [op-id ...]
  flush";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(1);
    }

    let mut client = Client::connect(args[0].as_str()).await?;
    match args[1].as_str() {
        "notify" if args.len() == 5 => {
            client.notify(&args[2], &args[3], &args[4]).await?;
            println!("ok");
        }
        "conflicts" if args.len() == 2 => {
            let entries = client.list_conflicts().await?;
            if entries.is_empty() {
                println!("no outstanding conflicts");
            }
            for entry in entries {
                let baseline = entry
                    .baseline
                    .to_json_string()
                    .unwrap_or_else(|_| "<unprintable>".to_string());
                println!("{}: baseline {baseline}", entry.diff);
                for (id, op) in &entry.rejected {
                    let source = op.source.as_deref().unwrap_or("-");
                    println!("  {id} [{source}] {op}");
                }
            }
        }
        "resolve" if args.len() >= 3 => {
            let diff = DiffId(args[2].trim_start_matches('D').parse()?);
            let mut ops = Vec::new();
            for raw in &args[3..] {
                ops.push(OpId(raw.trim_start_matches('O').parse()?));
            }
            client.resolve(diff, ops).await?;
            println!("ok");
        }
        "flush" if args.len() == 2 => {
            println!("{}", client.flush_work_queue().await?);
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }
    Ok(())
}
