use clap::{arg,crate_version,Command};
use fpgist::{algebra,text};

const RCH: &str = "unreachable was reached";

fn main() -> Result<(),Box<dyn std::error::Error>>
{
    env_logger::init();

    let long_help =
"Examples:
---------
Compare:       `fpgist compare -a one.fp -b two.fp`
Compress:      `fpgist compress -i full.fp -o key.fp`
Inspect:       `fpgist info -i one.fp`";

    let mut main_cmd = Command::new("fpgist")
        .about("Score and transform audio fingerprints")
        .after_long_help(long_help)
        .version(crate_version!());
    main_cmd = main_cmd.subcommand(Command::new("compare")
        .arg(arg!(-a --first <PATH> "first fingerprint").required(true))
        .arg(arg!(-b --second <PATH> "second fingerprint").required(true))
        .about("score two fingerprints against each other"));

    main_cmd = main_cmd.subcommand(Command::new("compress")
        .arg(arg!(-i --input <PATH> "input path").required(true))
        .arg(arg!(-o --output <PATH> "output path").required(true))
        .about("reduce a fingerprint to its index key window"));

    main_cmd = main_cmd.subcommand(Command::new("info")
        .arg(arg!(-i --input <PATH> "input path").required(true))
        .about("print fingerprint header fields"));

    let matches = main_cmd.get_matches();

    if let Some(cmd) = matches.subcommand_matches("compare") {
        let path_a = cmd.get_one::<String>("first").expect(RCH);
        let path_b = cmd.get_one::<String>("second").expect(RCH);
        let fp_a = text::parse(&std::fs::read_to_string(path_a)?)?;
        let fp_b = text::parse(&std::fs::read_to_string(path_b)?)?;
        let val = algebra::compare(&fp_a,&fp_b);
        println!("score {:.6}",val);
        println!("exact {}",algebra::is_eq(&fp_a,&fp_b));
        println!("match {}",algebra::is_match(&fp_a,&fp_b));
    }

    if let Some(cmd) = matches.subcommand_matches("compress") {
        let path_in = cmd.get_one::<String>("input").expect(RCH);
        let path_out = cmd.get_one::<String>("output").expect(RCH);
        let fp = text::parse(&std::fs::read_to_string(path_in)?)?;
        let key = fp.key_window();
        eprintln!("compressed {} words into {}",fp.cprint.len(),key.cprint.len());
        std::fs::write(path_out,text::emit(&key))?;
    }

    if let Some(cmd) = matches.subcommand_matches("info") {
        let path_in = cmd.get_one::<String>("input").expect(RCH);
        let fp = text::parse(&std::fs::read_to_string(path_in)?)?;
        println!("songlen {}",fp.songlen);
        println!("bit_rate {}",fp.bit_rate);
        println!("num_errors {}",fp.num_errors);
        println!("cprint_len {}",fp.cprint.len());
    }

    Ok(())
}
