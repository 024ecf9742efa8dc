fn main() -> std::process::ExitCode {
  budc_controller_lib::run()
}
