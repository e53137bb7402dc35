fn main() -> anyhow::Result<()> {
    deployd_cli::run()
}
