use ring_repair_lib::{
    cli::{parse_args, Command},
    commands::{run_segments, run_status, run_worker},
};

#[tokio::main]
async fn main() {
    let cli = parse_args();
    let exit_code = match cli.command {
        Command::Run(args) => run_worker(args).await,
        Command::Segments(args) => run_segments(args),
        Command::Status(args) => run_status(args).await,
    };
    std::process::exit(exit_code);
}
