#[cfg(not(unix))]
fn main() {
    eprintln!("chassis-subprocess is only implemented for UNIX");
    std::process::exit(1);
}

#[cfg(unix)]
fn main() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    chassis_arg0::handle_app_start(chassis_cli::default_registry())
}
