//! Configuration types shared between VLN submission crates.

mod launch;
mod types;

pub use launch::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_type_roundtrip() {
        assert_eq!("train".parse::<RunType>().unwrap(), RunType::Train);
        assert_eq!("eval".parse::<RunType>().unwrap(), RunType::Eval);
        assert_eq!("inference".parse::<RunType>().unwrap(), RunType::Inference);
        assert_eq!(RunType::Eval.to_string(), "eval");
        assert!("test".parse::<RunType>().is_err());
    }

    #[test]
    fn test_run_type_serde() {
        assert_eq!(
            serde_json::from_str::<RunType>("\"train\"").unwrap(),
            RunType::Train
        );
        assert_eq!(
            serde_json::to_string(&RunType::Inference).unwrap(),
            "\"inference\""
        );
    }

    #[test]
    fn test_walltime_parse() {
        assert_eq!("24:00".parse::<WallTime>().unwrap().minutes(), 24 * 60);
        assert_eq!("4:30".parse::<WallTime>().unwrap().minutes(), 270);
        assert_eq!("90".parse::<WallTime>().unwrap().minutes(), 90);
        assert_eq!("120:00".parse::<WallTime>().unwrap().minutes(), 7200);
        assert!("".parse::<WallTime>().is_err());
        assert!("4:75".parse::<WallTime>().is_err());
        assert!("0:00".parse::<WallTime>().is_err());
        assert!("abc".parse::<WallTime>().is_err());
    }

    #[test]
    fn test_walltime_display() {
        assert_eq!("24:00".parse::<WallTime>().unwrap().to_string(), "24:00");
        assert_eq!("90".parse::<WallTime>().unwrap().to_string(), "1:30");
        assert_eq!(WallTime::from_minutes(5).to_string(), "0:05");
    }

    #[test]
    fn test_walltime_serde_roundtrip() {
        let wt: WallTime = "4:00".parse().unwrap();
        let json = serde_json::to_string(&wt).unwrap();
        assert_eq!(json, "\"4:00\"");
        let decoded: WallTime = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, wt);
    }

    #[test]
    fn test_resource_profile_defaults() {
        let profile = ResourceProfile::default();
        assert_eq!(profile.cpus, 16);
        assert_eq!(profile.mem_mb, 4096);
        assert_eq!(profile.gpus, 1);
        assert!(profile.gpu_model.is_none());
        assert_eq!(profile.walltime.to_string(), "24:00");
    }

    #[test]
    fn test_bsub_args_full_profile() {
        let profile = ResourceProfile {
            cpus: 16,
            mem_mb: 4096,
            gpus: 2,
            gpu_model: Some("GeForceRTX2080Ti".to_string()),
            walltime: "24:00".parse().unwrap(),
            output_log: Some("train.out".to_string()),
        };
        assert_eq!(
            profile.to_bsub_args(),
            vec![
                "-n",
                "16",
                "-W",
                "24:00",
                "-R",
                "rusage[mem=4096,ngpus_excl_p=2]",
                "-R",
                "select[gpu_model0==GeForceRTX2080Ti]",
                "-o",
                "train.out",
            ]
        );
    }

    #[test]
    fn test_bsub_args_cpu_only() {
        let profile = ResourceProfile {
            gpus: 0,
            ..Default::default()
        };
        let args = profile.to_bsub_args();
        assert_eq!(args[4], "-R");
        assert_eq!(args[5], "rusage[mem=4096]");
        assert!(!args.iter().any(|a| a.contains("ngpus_excl_p")));
        assert!(!args.iter().any(|a| a.contains("select")));
    }

    #[test]
    fn test_entry_args() {
        let params = LaunchParams {
            exp_config: "config/experiments/waypoint.yaml".to_string(),
            run_type: RunType::Train,
            ..Default::default()
        };
        assert_eq!(
            params.to_entry_args(),
            vec![
                "--exp-config",
                "config/experiments/waypoint.yaml",
                "--run-type",
                "train",
            ]
        );
    }

    #[test]
    fn test_entry_args_with_opts() {
        let params = LaunchParams {
            exp_config: "cfg.yaml".to_string(),
            run_type: RunType::Eval,
            opts: vec!["TASK_CONFIG.SEED".into(), "42".into()],
            ..Default::default()
        };
        let args = params.to_entry_args();
        assert_eq!(&args[4..], ["TASK_CONFIG.SEED", "42"]);
    }

    #[test]
    fn test_launcher_args_plain() {
        let params = LaunchParams {
            exp_config: "cfg.yaml".to_string(),
            ..Default::default()
        };
        let args = params.to_launcher_args("run.py");
        assert_eq!(args[0], "run.py");
        assert_eq!(args[1], "--exp-config");
    }

    #[test]
    fn test_launcher_args_distributed() {
        let params = LaunchParams {
            exp_config: "cfg.yaml".to_string(),
            nproc_per_node: Some(2),
            master_port: Some(29510),
            ..Default::default()
        };
        let args = params.to_launcher_args("run.py");
        assert_eq!(
            &args[..5],
            [
                "-m",
                "torch.distributed.launch",
                "--nproc_per_node=2",
                "--master_port=29510",
                "run.py",
            ]
        );
    }

    #[test]
    fn test_validate() {
        let good = LaunchParams {
            exp_config: "cfg.yaml".to_string(),
            ..Default::default()
        };
        assert!(good.validate().is_ok());

        let no_config = LaunchParams::default();
        assert!(no_config.validate().is_err());

        let zero_workers = LaunchParams {
            exp_config: "cfg.yaml".to_string(),
            nproc_per_node: Some(0),
            ..Default::default()
        };
        assert!(zero_workers.validate().is_err());

        let odd_opts = LaunchParams {
            exp_config: "cfg.yaml".to_string(),
            opts: vec!["TASK_CONFIG.SEED".into()],
            ..Default::default()
        };
        assert!(odd_opts.validate().is_err());
    }

    #[test]
    fn test_launch_params_toml() {
        let params: LaunchParams = toml::from_str(
            r#"
exp_config = "config/experiments/waypoint.yaml"
run_type = "train"
nproc_per_node = 2
"#,
        )
        .unwrap();
        assert_eq!(params.run_type, RunType::Train);
        assert_eq!(params.nproc_per_node, Some(2));
        assert!(params.opts.is_empty());
    }
}
