//! 远程启动节点
//!
//! 启动命令模板中 `%h` 替换为目标主机名，`%c` 替换为远程命令。
//! 远程命令让被启动的进程监听，并带着请求 id 回连本地节点的监听地址。

use std::process::Stdio;

use log::{debug, info, warn};
use tokio::process::Command;

use crate::{context::Context, network::ConnectionDescription};

/// 被启动的进程需要的命令行参数
///
/// 程序和参数整体放在一对单引号里，作为 `%c` 的一个参数传给启动模板。
/// 模板需要经过一个会重新分词的 shell，例如 `ssh -n %h %c`，
/// 远程 shell 拼接参数后再拆开。直接用 `%c` 在本地执行时单引号里的内容
/// 会被当成一个程序名。
pub(crate) fn remote_command(ctx: &Context, listener: &ConnectionDescription, request_id: u32) -> String {
    let mut command = String::from("env ");
    for (name, value) in &ctx.forwarded_env {
        command.push_str(&format!("{}={} ", name, value));
    }
    command.push_str(&format!(
        "'{} --sync-listen --sync-client {}:{}'",
        ctx.program_name, request_id, listener
    ));
    command
}

/// 替换模板中的占位符，模板中没有 `%c` 时把远程命令追加到末尾
pub(crate) fn launch_command(template: &str, hostname: &str, remote: &str) -> String {
    let mut result = String::with_capacity(template.len() + remote.len());
    let mut command_found = false;
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('c') => {
                result.push_str(remote);
                command_found = true;
            }
            Some('h') => result.push_str(hostname),
            Some(token) => warn!("unknown token %{} in launch command", token),
            None => warn!("dangling % in launch command"),
        }
    }

    if !command_found {
        result.push(' ');
        result.push_str(remote);
    }
    result
}

/// 在后台执行启动命令，不等待其结束
pub(crate) fn launch(command: &str) -> std::io::Result<()> {
    info!("launch command: {}", command);
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .spawn()?;
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!("launch command exited with {}", status),
            Err(e) => warn!("wait for launch command error: {}", e),
        }
    });
    Ok(())
}

/// 解析 `<request_id>:<address>`
pub(crate) fn parse_client_arg(arg: &str) -> Option<(u32, ConnectionDescription)> {
    let (id, address) = arg.split_once(':')?;
    let id = id.trim().parse::<u32>().ok()?;
    let description = address.parse::<ConnectionDescription>().ok()?;
    Some((id, description))
}
