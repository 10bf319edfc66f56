use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("benchlink {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: benchlink");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("BENCHLINK_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "profile: {}",
        option_env!("BENCHLINK_BUILD_PROFILE").unwrap_or("unknown")
    );
    println!("features: cli=true, async={}", cfg!(feature = "async"));
    println!("codecs: binary, ascii, scpi");

    Ok(SUCCESS)
}
