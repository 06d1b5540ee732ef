/// CLI for the CoachLink client
fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    coachlink_core::cli_app::run(args)
}
