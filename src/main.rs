mod artifacts;
mod cache;
mod cli;
mod conf;
mod dag;
mod docker;
mod errors;
mod logs;
mod manifest;
mod provisioners;
mod session;
mod source;
mod sshagent;
mod steprunner;
mod vcs;
mod workload;

#[tokio::main]
async fn main() {
    let code = cli::init().await;
    std::process::exit(code);
}
