use crate::locator::DesignPair;
use crate::rundir::RunPaths;

pub const BOOTSTRAP_SCRIPT: &str = "bootstrap.tcl";
pub const RESTORE_WRAPPER_SCRIPT: &str = "restore_wrapper.tcl";

/// The fixed set of variables bound into every rendered script. Names are
/// part of the contract with Skill authors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSurface {
    pub run_dir: String,
    pub scripts_dir: String,
    pub reports_dir: String,
    pub job_id: String,
    pub enc_path: String,
    pub enc_dat_path: String,
}

impl VariableSurface {
    pub fn new(paths: &RunPaths, job_id: &str, pair: Option<&DesignPair>) -> Self {
        Self {
            run_dir: paths.root.display().to_string(),
            scripts_dir: paths.scripts_dir().display().to_string(),
            reports_dir: paths.reports_dir().display().to_string(),
            job_id: job_id.to_string(),
            enc_path: pair
                .map(|p| p.enc_path.display().to_string())
                .unwrap_or_default(),
            enc_dat_path: pair
                .map(|p| p.enc_dat_path.display().to_string())
                .unwrap_or_default(),
        }
    }

    pub fn bindings(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("SP_RUN_DIR", self.run_dir.as_str()),
            ("SP_SCRIPTS_DIR", self.scripts_dir.as_str()),
            ("SP_REPORTS_DIR", self.reports_dir.as_str()),
            ("SP_JOB_ID", self.job_id.as_str()),
            ("SP_ENC_PATH", self.enc_path.as_str()),
            ("SP_ENC_DAT_PATH", self.enc_dat_path.as_str()),
        ]
    }

    /// Tcl prelude binding the surface, prepended to every rendered script.
    pub fn render_prelude(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.bindings() {
            out.push_str(&format!("set {name} {}\n", tcl_quote(value)));
        }
        out
    }
}

/// Brace-quote a Tcl word; falls back to double quotes with escaping when the
/// value itself contains braces.
fn tcl_quote(value: &str) -> String {
    if !value.contains('{') && !value.contains('}') {
        return format!("{{{value}}}");
    }
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('"');
    for ch in value.chars() {
        match ch {
            '\\' | '"' | '$' | '[' | ']' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            other => escaped.push(other),
        }
    }
    escaped.push('"');
    escaped
}

/// Body of the restore wrapper. Invariant across sites: descriptors assume
/// their own directory as the base for relative references, so the wrapper
/// always changes into it before sourcing.
pub const RESTORE_WRAPPER_BODY: &str = r#"
cd [file dirname $SP_ENC_PATH]
source $SP_ENC_PATH
"#;

/// Body of the in-tool queue processor sourced at session start. One pass per
/// iteration: refresh the heartbeat, pick up unacknowledged requests in
/// filename order, validate the script path sandbox, source the script, and
/// write the ack through a rename. Exits when `session/stop` appears.
pub const BOOTSTRAP_BODY: &str = r#"
set SP_QUEUE_DIR [file join $SP_RUN_DIR queue]
set SP_ACK_DIR [file join $SP_RUN_DIR ack]
set SP_SESSION_DIR [file join $SP_RUN_DIR session]

proc sp_now {} {
    return [clock format [clock seconds] -format "%Y-%m-%dT%H:%M:%SZ" -gmt true]
}

proc sp_json_escape {text} {
    set map [list "\\" "\\\\" "\"" "\\\"" "\n" "\\n" "\r" "\\r" "\t" "\\t"]
    return [string map $map $text]
}

proc sp_write_atomic {path content} {
    set staged "$path.wip.[pid]"
    set fh [open $staged w]
    puts -nonewline $fh $content
    close $fh
    file rename -force $staged $path
}

proc sp_write_ack {request_id job_id status error_type message started_at} {
    global SP_ACK_DIR
    set ack_path [file join $SP_ACK_DIR "$request_id.json"]
    if {[file exists $ack_path]} { return }
    set body "{\n"
    append body "  \"schema_version\": \"1.0\",\n"
    append body "  \"request_id\": \"[sp_json_escape $request_id]\",\n"
    append body "  \"job_id\": \"[sp_json_escape $job_id]\",\n"
    append body "  \"status\": \"$status\",\n"
    append body "  \"error_type\": \"$error_type\",\n"
    append body "  \"message\": \"[sp_json_escape $message]\",\n"
    append body "  \"started_at\": \"$started_at\",\n"
    append body "  \"finished_at\": \"[sp_now]\"\n"
    append body "}\n"
    sp_write_atomic $ack_path $body
}

proc sp_refresh_heartbeat {} {
    global SP_SESSION_DIR
    set fh [open [file join $SP_SESSION_DIR heartbeat] w]
    puts -nonewline $fh [clock seconds]
    close $fh
}

proc sp_request_field {raw name} {
    if {[regexp "\"$name\"\\s*:\\s*\"(\[^\"\]*)\"" $raw -> value]} {
        return $value
    }
    return ""
}

proc sp_script_allowed {script} {
    global SP_RUN_DIR
    if {$script eq ""} { return 0 }
    if {[string index $script 0] eq "/"} { return 0 }
    if {[string first ".." $script] >= 0} { return 0 }
    if {![string match "scripts/*" $script]} { return 0 }
    set resolved [file normalize [file join $SP_RUN_DIR $script]]
    set root [file normalize [file join $SP_RUN_DIR scripts]]
    if {[string first "$root/" "$resolved/"] != 0} { return 0 }
    return 1
}

while {1} {
    sp_refresh_heartbeat
    if {[file exists [file join $SP_SESSION_DIR stop]]} {
        puts "stop observed, queue processor exiting"
        break
    }
    foreach request_path [lsort [glob -nocomplain -directory $SP_QUEUE_DIR *.json]] {
        set request_id [file rootname [file tail $request_path]]
        if {[file exists [file join $SP_ACK_DIR "$request_id.json"]]} { continue }
        set started_at [sp_now]
        set fh [open $request_path r]
        set raw [read $fh]
        close $fh
        set action [sp_request_field $raw action]
        set script [sp_request_field $raw script]
        puts "processing request $request_id script $script"
        if {$action ne "SOURCE_TCL"} {
            sp_write_ack $request_id $SP_JOB_ID FAIL CMD_FAIL "unsupported action: $action" $started_at
            continue
        }
        if {![sp_script_allowed $script]} {
            sp_write_ack $request_id $SP_JOB_ID FAIL CMD_FAIL "security violation: $script" $started_at
            continue
        }
        if {[catch {source [file join $SP_RUN_DIR $script]} sp_err]} {
            if {[string match "*restore_wrapper*" $script]} {
                set sp_etype RESTORE_FAIL
            } else {
                set sp_etype CMD_FAIL
            }
            sp_write_ack $request_id $SP_JOB_ID FAIL $sp_etype $sp_err $started_at
        } else {
            sp_write_ack $request_id $SP_JOB_ID PASS OK "script completed" $started_at
        }
    }
    after 200
}
"#;
