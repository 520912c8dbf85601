use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Opts {
    /// Host to ping, a hostname or an IPv4 literal
    pub host: String,
    /// Time to wait for each reply, in seconds
    #[arg(long, short, default_value_t = 4.0)]
    pub timeout: f64,
    /// Number of probes to send, 0 meaning run until interrupted
    #[arg(long, short, default_value_t = 0)]
    pub count: u64,
    /// Pause between probes, in seconds
    #[arg(long, short, default_value_t = 1.0)]
    pub interval: f64,
}
