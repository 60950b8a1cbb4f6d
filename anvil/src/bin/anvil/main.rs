use anvil::buildfile::{self, Buildspec};
use anvil::core::action::{
    Action, ActionTarget, MetaOperationInfo, OperationInfo, DEFAULT_ID, UPDATE_ID,
};
use anvil::core::{error, project, BuildError, Context, Options};
use anvil::utils::IResult;
use clap::Parser;
use std::path::PathBuf;
use std::process::exit;

#[derive(Parser, Debug)]
#[command(
    name = "anvil",
    about = "A general-purpose build engine",
    disable_version_flag = true
)]
struct Args {
    /// Print actual commands being executed.
    #[arg(short = 'v')]
    verbose_commands: bool,

    /// Print all underlying commands.
    #[arg(short = 'V')]
    verbose_all: bool,

    /// Set the diagnostics verbosity level.
    #[arg(long, value_name = "N")]
    verbose: Option<u32>,

    /// Only print errors.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Display build progress.
    #[arg(short = 'p', long)]
    progress: bool,

    /// Don't display build progress.
    #[arg(long)]
    no_progress: bool,

    /// Number of active jobs to perform in parallel.
    #[arg(short = 'j', long, value_name = "N")]
    jobs: Option<usize>,

    /// Maximum number of jobs (threads) to create.
    #[arg(short = 'J', long, value_name = "N")]
    max_jobs: Option<usize>,

    /// Queue depth as a multiplier over the number of active jobs.
    #[arg(short = 'Q', long, value_name = "N")]
    queue_depth: Option<usize>,

    /// Maximum stack size in KB for worker threads.
    #[arg(long, value_name = "KB")]
    max_stack: Option<usize>,

    /// Run serially and stop at the first error.
    #[arg(short = 's', long)]
    serial_stop: bool,

    /// Write the result of execution in a machine-readable form.
    #[arg(long)]
    structured_result: bool,

    /// Match the rules without executing the operation.
    #[arg(long)]
    match_only: bool,

    /// Don't print column numbers in diagnostics.
    #[arg(long)]
    no_column: bool,

    /// Don't print line and column numbers in diagnostics.
    #[arg(long)]
    no_line: bool,

    /// The alternative file to read build information from.
    #[arg(long, value_name = "PATH")]
    buildfile: Option<PathBuf>,

    /// The config.guess(1) script to use for configuration.
    #[arg(long, value_name = "PATH")]
    config_guess: Option<PathBuf>,

    /// The config.sub(1) script to use for configuration.
    #[arg(long, value_name = "PATH")]
    config_sub: Option<PathBuf>,

    /// The pager program to be used to show long text.
    #[arg(long, value_name = "PATH")]
    pager: Option<PathBuf>,

    /// An additional option to be passed to the pager program.
    #[arg(long = "pager-option", value_name = "OPT")]
    pager_options: Vec<String>,

    /// Print version and exit.
    #[arg(long)]
    version: bool,

    /// Variables and buildspec: meta-op(op(targets...)...)...
    #[arg(value_name = "BUILDSPEC")]
    rest: Vec<String>,
}

fn main() {
    exit(run());
}

fn run() -> i32 {
    let args = Args::parse();

    if args.version {
        println!("anvil {}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    let mut options = Options::default();
    options.verbosity = if args.quiet {
        0
    } else if let Some(n) = args.verbose {
        n
    } else if args.verbose_all {
        3
    } else if args.verbose_commands {
        2
    } else {
        1
    };
    if args.progress {
        options.progress = Some(true);
    }
    if args.no_progress {
        options.progress = Some(false);
    }
    if let Some(j) = args.jobs {
        options.jobs = j.max(1);
    }
    if let Some(j) = args.max_jobs {
        options.max_jobs = j.max(1);
    }
    if let Some(q) = args.queue_depth {
        options.queue_depth = q.max(1);
    }
    options.max_stack = args.max_stack;
    options.serial_stop = args.serial_stop;
    options.structured_result = args.structured_result;
    options.match_only = args.match_only;
    options.no_column = args.no_column;
    options.no_line = args.no_line;
    options.buildfile = args.buildfile;
    options.config_guess = args.config_guess;
    options.config_sub = args.config_sub;
    options.pager = args.pager;
    options.pager_options = args.pager_options;

    let mut cx = match Context::new(options) {
        Ok(cx) => cx,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return 1;
        }
    };

    // Leading name=value arguments are variable overrides; the rest form
    // the buildspec.
    let mut spec_args = Vec::new();
    for a in args.rest {
        match cx.enter_override(&a) {
            Ok(true) => {}
            Ok(false) => spec_args.push(a),
            Err(e) => {
                cx.report(&e);
                return 1;
            }
        }
    }

    let bspec = match buildfile::parse_buildspec(&spec_args) {
        Ok(b) => b,
        Err(e) => {
            cx.report(&e);
            return 1;
        }
    };

    match run_buildspec(&mut cx, bspec) {
        Ok(()) => 0,
        Err(e) => {
            if !error::reported(&e) {
                cx.report(&e);
            }
            1
        }
    }
}

/// Drives the buildspec: meta-operation batches, then operation batches,
/// then targets, with the batch-consistency checks in between. Batches
/// are strictly sequential; targets within an operation batch may be
/// built in parallel by the scheduler.
fn run_buildspec(cx: &mut Context, bspec: Buildspec) -> IResult<()> {
    for ms in bspec {
        let mut mif: Option<&'static MetaOperationInfo> = None;
        let mut lifted = false;

        for os in &ms.ops {
            // If the previous operation was lifted to a meta-operation,
            // end that batch.
            if lifted {
                finish_meta(cx, &mut mif)?;
                lifted = false;
            }

            let mut act: Option<Action> = None;
            let mut tgs: Vec<ActionTarget> = Vec::new();

            for ts in &os.targets {
                let setup = project::setup_target(cx, &ts.name, ts.src_base.clone())?;
                let root = setup.root;

                // Resolve the requested names against the root scope's
                // tables, lifting an operation name that turns out to be
                // a meta-operation.
                let mut m: Option<&'static MetaOperationInfo> = None;
                let mut o: Option<&'static OperationInfo> = None;
                let mut lift = false;
                {
                    let scope = cx.scopes.get(root);
                    if !os.name.is_empty() {
                        if let Some(mm) = scope
                            .meta_operations
                            .iter()
                            .find(|x| x.name == os.name)
                        {
                            if !ms.name.is_empty() {
                                anyhow::bail!(
                                    "nested meta-operation {}({})",
                                    ms.name,
                                    os.name
                                );
                            }
                            lift = true;
                            m = Some(*mm);
                        } else if let Some(oo) =
                            scope.operations.iter().find(|x| x.name == os.name)
                        {
                            o = Some(*oo);
                        } else {
                            let mut msg =
                                format!("unknown operation `{}`", os.name);
                            if setup.guessing && !setup.bootstrapped {
                                msg.push_str(&format!(
                                    "; consider explicitly specifying src_base for `{}`",
                                    ts.name
                                ));
                            }
                            anyhow::bail!(msg);
                        }
                    }
                    if !ms.name.is_empty() {
                        m = Some(
                            *scope
                                .meta_operations
                                .iter()
                                .find(|x| x.name == ms.name)
                                .ok_or_else(|| {
                                    anyhow::anyhow!("unknown meta-operation `{}`", ms.name)
                                })?,
                        );
                    }
                }

                // The operation name was lifted to a meta-operation: end
                // the current meta-operation batch.
                if lift && !lifted {
                    if mif.is_some() {
                        finish_meta(cx, &mut mif)?;
                    }
                    lifted = true;
                }

                // The default meta-operation is perform.
                let m = m.unwrap_or(&project::PERFORM);

                match mif {
                    None => mif = Some(m),
                    Some(prev) => {
                        if !std::ptr::eq(prev, m) {
                            anyhow::bail!(BuildError::MetaOpMismatch);
                        }
                    }
                }

                // Translate the operation through the meta-operation.
                let requested = o.map(|x| x.id).unwrap_or(DEFAULT_ID);
                let oid = match m.operation_pre {
                    Some(f) => f(requested),
                    None => {
                        if requested == DEFAULT_ID {
                            UPDATE_ID
                        } else {
                            requested
                        }
                    }
                };

                match act {
                    None => act = Some(Action::new(m.id, oid)),
                    Some(a) => {
                        if a.op != oid {
                            anyhow::bail!(BuildError::OpMismatch);
                        }
                    }
                }
                let a = act.unwrap();

                (m.load)(cx, root, setup.base, &setup.buildfile)?;
                let at = (m.match_)(cx, a, root, setup.base, &ts.name)?;
                tgs.push(at);
            }

            if let (Some(m), Some(a)) = (mif, act) {
                (m.execute)(cx, a, &tgs)?;
            }

            // A happens-before barrier between operation batches.
            cx.targets.reset_action();
        }

        finish_meta(cx, &mut mif)?;
    }
    Ok(())
}

fn finish_meta(
    cx: &mut Context,
    mif: &mut Option<&'static MetaOperationInfo>,
) -> IResult<()> {
    if let Some(m) = mif.take() {
        if let Some(post) = m.meta_operation_post {
            post(cx)?;
        }
    }
    Ok(())
}
