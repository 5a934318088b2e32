use egress_router::commands::run_cni;

fn main() {
    if let Err(err) = run_cni() {
        match serde_json::to_string(&err) {
            Ok(json) => println!("{}", json),
            Err(_) => println!(
                r#"{{"cniVersion":"{}","code":{},"msg":"{}"}}"#,
                err.cni_version,
                err.code,
                err.msg.replace('"', "\\\"")
            ),
        }
        std::process::exit(1);
    }
}
