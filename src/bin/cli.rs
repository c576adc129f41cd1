//! Provcom command line interface.

use std::process;

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
    ArgMatches,
};
use console::style;
use log::{debug, trace, warn, LevelFilter};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use simplelog::*;

use provcom::{self as pv, DeviceManager};

fn main() {
    println!("[PV] provcom v{}", crate_version!());

    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Provcom drives a provisioning station for ESP32 boards. For each \
            board plugged in, it:\n\
               \t* erases the flash and writes the diagnostic firmware \n\
               \t* reads the JSON self-test report printed on the console \n\
               \t* submits the report to the backend and prints the label \n\
               \t* if every check passed, decrypts the final firmware and \
                   writes it to the board \n\
            \n\
            It then waits for the operator to plug the next board.\n\
            \n\
            Flashing is done with `esptool.py`, which must be installed. The \
            final firmware key and IV are read from the PROVCOM_IMAGE_KEY and \
            PROVCOM_IMAGE_IV environment variables when not given on the \
            command line.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .arg(
            Arg::with_name("DEVICE_TTY")
                .help("the USB tty device of the board")
                .long_help(
                    "the USB tty device of the board; when not set, every \
                     serial port is scanned for an ESP32.",
                )
                .short("-t")
                .long("--tty")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("CHIP")
                .help("chip type passed to the flashing tool")
                .long("--chip")
                .takes_value(true)
                .default_value("esp32")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BAUD_RATE")
                .help("serial monitor baud rate")
                .short("-b")
                .long("--baud-rate")
                .takes_value(true)
                .default_value("115200")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("DATA_BITS")
                .help("number of bits per character")
                .short("-d")
                .long("--data-bits")
                .takes_value(true)
                .possible_values(&["5", "6", "7", "8"])
                .default_value("8")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("STOP_BITS")
                .help("number of stop bits per byte")
                .short("-s")
                .long("--stop-bits")
                .takes_value(true)
                .possible_values(&["1", "2"])
                .default_value("1")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PARITY")
                .help("parity checking protocol")
                .short("-p")
                .long("--parity")
                .takes_value(true)
                .possible_values(&["none", "odd", "even"])
                .default_value("none")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("FLOW_CONTROL")
                .help("flow control mode")
                .short("-f")
                .long("--flow-control")
                .takes_value(true)
                .possible_values(&["none", "soft", "hard"])
                .default_value("none")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("FLASH_BAUD")
                .help("preferred flashing baud rate")
                .long("--flash-baud")
                .takes_value(true)
                .default_value("460800")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("FALLBACK_BAUD")
                .help("baud rate of the final firmware retry")
                .long("--fallback-baud")
                .takes_value(true)
                .default_value("115200")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("ESPTOOL")
                .help("flashing tool command line")
                .long_help(
                    "flashing tool command line, split on whitespace, e.g. \
                     `python -m esptool`.",
                )
                .long("--esptool")
                .takes_value(true)
                .default_value("esptool.py")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("FACTORY_DIR")
                .help("build directory of the diagnostic firmware")
                .long("--factory-dir")
                .takes_value(true)
                .default_value("build")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("WORK_DIR")
                .help("directory for the temporary decrypted firmware")
                .long("--work-dir")
                .takes_value(true)
                .default_value(".build")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("IMAGE_KEY")
                .help("AES key of the final firmware (16, 24 or 32 characters)")
                .long("--key")
                .takes_value(true)
                .env("PROVCOM_IMAGE_KEY")
                .hide_env_values(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("IMAGE_IV")
                .help("AES-CBC IV of the final firmware (16 characters)")
                .long("--iv")
                .takes_value(true)
                .env("PROVCOM_IMAGE_IV")
                .hide_env_values(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("API_URL")
                .help("backend endpoint the reports are posted to")
                .long("--api-url")
                .takes_value(true)
                .env("PROVCOM_API_URL")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("API_TOKEN")
                .help("backend access token")
                .long("--api-token")
                .takes_value(true)
                .env("PROVCOM_API_TOKEN")
                .hide_env_values(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BATCH")
                .help("production batch number")
                .long("--batch")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("LINK_FIELD")
                .help("response field holding the label link")
                .long("--link-field")
                .takes_value(true)
                .default_value("auvoLink")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("LABEL_COMMAND")
                .help("label printing command line")
                .long_help(
                    "label printing command line, split on whitespace; it is \
                     called with `--qr`, `--text`, `--printer` and `--template` \
                     arguments. When not set, labels are shown on the console.",
                )
                .long("--label-command")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PRINTER")
                .help("label printer name")
                .long("--printer")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("LABEL_TEMPLATE")
                .help("label template file")
                .long("--label-template")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("SSID_PREFIX")
                .help("prefix of the SSID printed on the label")
                .long("--ssid-prefix")
                .takes_value(true)
                .default_value("RCD-")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("LABEL_LINE")
                .help("extra line printed on the label, may be repeated")
                .long("--label-line")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("FINAL_IMAGE")
                .help("path to the encrypted final firmware")
                .long_help(
                    "path to the encrypted final firmware; when not set, \
                     `final-firmware/firmware-combined.bin.enc` is used.",
                )
                .index(1),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
        .get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'provcom -v -v -v' or 'provcom -vvv' vs 'provcom -v'
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    if let Err(e) = TermLogger::init(
        log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ) {
        eprintln!("{}: could not set up logging: {}", style("warning").yellow(), e);
    }

    trace!("{:#?}", matches);

    // Arguments with default values ===========================================

    // It's safe to call unwrap on all command line arguments with default
    // values, because the value with either be what the user input at runtime
    // or the default value

    let baud_rate = numeric(&matches, "BAUD_RATE", "baud-rate");
    let flash_baud = numeric(&matches, "FLASH_BAUD", "flash-baud");
    let fallback_baud = numeric(&matches, "FALLBACK_BAUD", "fallback-baud");

    let data_bits = match matches.value_of("DATA_BITS").unwrap() {
        "5" => DataBits::Five,
        "6" => DataBits::Six,
        "7" => DataBits::Seven,
        "8" => DataBits::Eight,
        _ => unreachable!(),
    };

    let stop_bits = match matches.value_of("STOP_BITS").unwrap() {
        "1" => StopBits::One,
        "2" => StopBits::Two,
        _ => unreachable!(),
    };

    let parity = match matches.value_of("PARITY").unwrap() {
        "none" => Parity::None,
        "even" => Parity::Even,
        "odd" => Parity::Odd,
        _ => unreachable!(),
    };

    let flow_control = match matches.value_of("FLOW_CONTROL").unwrap() {
        "none" => FlowControl::None,
        "soft" => FlowControl::Software,
        "hard" => FlowControl::Hardware,
        _ => unreachable!(),
    };

    // END - Arguments with default values =====================================

    let mut builder = pv::SettingsBuilder::default()
        .chip(matches.value_of("CHIP").unwrap())
        .baud_rate(baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .flow_control(flow_control)
        .flash_baud_rate(flash_baud)
        .fallback_baud_rate(fallback_baud)
        .flash_tool(matches.value_of("ESPTOOL").unwrap().split_whitespace())
        .factory_dir(matches.value_of("FACTORY_DIR").unwrap())
        .work_dir(matches.value_of("WORK_DIR").unwrap())
        .link_field(matches.value_of("LINK_FIELD").unwrap())
        .ssid_prefix(matches.value_of("SSID_PREFIX").unwrap());

    // START - Arguments with NO default values ================================

    if let Some(path) = matches.value_of("DEVICE_TTY") {
        builder = builder.path(path);
    }

    if let Some(image) = matches.value_of("FINAL_IMAGE") {
        builder = builder.encrypted_image(image);
    }

    match (matches.value_of("IMAGE_KEY"), matches.value_of("IMAGE_IV")) {
        (Some(key), Some(iv)) => match pv::ImageKey::new(key.as_bytes(), iv.as_bytes()) {
            Ok(key) => builder = builder.image_key(key),
            Err(e) => fail("key", &e.to_string()),
        },
        (None, None) => warn!("no image key given, the final firmware will never be committed"),
        _ => fail("key", "the AES key and IV must be given together"),
    }

    if let Some(url) = matches.value_of("API_URL") {
        builder = builder.api_url(url);
    }
    if let Some(token) = matches.value_of("API_TOKEN") {
        builder = builder.api_token(token);
    }
    if let Some(batch) = matches.value_of("BATCH") {
        builder = builder.batch_number(batch);
    }

    if let Some(command) = matches.value_of("LABEL_COMMAND") {
        builder = builder.label_command(command.split_whitespace());
    }
    if let Some(printer) = matches.value_of("PRINTER") {
        builder = builder.printer(printer);
    }
    if let Some(template) = matches.value_of("LABEL_TEMPLATE") {
        builder = builder.label_template(template);
    }
    if let Some(lines) = matches.values_of("LABEL_LINE") {
        for line in lines {
            builder = builder.label_line(line);
        }
    }

    // END - Arguments =========================================================

    let settings = builder.finalize();

    // Exiting skips destructors, so the handler removes the plaintext image
    // of an interrupted commit itself.
    let plaintext = settings.final_image.decrypted_path();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("🛑 received Ctrl+C!");
        if let Err(e) = pv::image::remove_stale_plaintext(&plaintext) {
            eprintln!("could not remove {}: {}", plaintext.display(), e);
        }
        process::exit(0);
    }) {
        eprintln!("{}: could not install the Ctrl-C handler: {}", style("warning").yellow(), e);
    }

    let collaborators = collaborators(&settings);

    // Run the state machine ===================================================

    let mut station = pv::Station::new(settings, collaborators);
    let exit_code = station.run();
    debug!("exit code: {}", exit_code);
    std::process::exit(exit_code.into());
}

/// The real hardware, network and terminal behind the station.
fn collaborators(settings: &pv::Settings) -> pv::Collaborators {
    let backend = pv::HttpBackend::new(settings.api.clone())
        .unwrap_or_else(|e| fail("api-url", &e.to_string()));

    let printer: Box<dyn pv::LabelPrinter> = if settings.label.command.is_empty() {
        Box::new(pv::ConsoleLabelPrinter)
    } else {
        match pv::CommandLabelPrinter::new(&settings.label.command) {
            Ok(printer) => Box::new(printer),
            Err(e) => fail("label-command", &e.to_string()),
        }
    };

    pv::Collaborators {
        ports: Box::new(pv::SystemPorts),
        flash_tool: Box::new(pv::EspTool::new(&settings.flash.tool)),
        monitor: Box::new(pv::SerialMonitor),
        backend: Box::new(backend),
        printer,
        operator: Box::new(pv::ConsoleOperator),
    }
}

fn numeric(matches: &ArgMatches, name: &str, flag: &str) -> u32 {
    value_t!(matches.value_of(name), u32).unwrap_or_else(|_| {
        fail(
            flag,
            &format!(
                "`{}` needs to be a numeric value",
                matches.value_of(name).unwrap_or_default()
            ),
        )
    })
}

fn fail(flag: &str, message: &str) -> ! {
    println!(
        "{}: invalid `{}`",
        style("error").red(),
        style(flag).cyan()
    );
    println!("   {} {}", style("-->").cyan(), message);
    process::exit(-1);
}
