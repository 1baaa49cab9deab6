use std::time::Duration;

use fbp_channel::{
    ChannelError, ChannelHost, ChannelReader, ChannelWriter, ConnectionManager, HostOptions, Msg,
    NamedPortRef, Negotiator, PortInfos, Ports, StartupReport,
};
use serde_json::json;
use tokio::sync::oneshot;

struct Running {
    infos: Vec<fbp_channel::StartupInfo>,
    stop: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl Running {
    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = self.task.await;
    }
}

async fn start(options: HostOptions) -> Running {
    let host = ChannelHost::bind(options).await.unwrap();
    let infos = host.startup_infos().to_vec();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(host.serve(async move {
        let _ = stopped.await;
    }));
    Running {
        infos,
        stop: Some(stop),
        task,
    }
}

fn manager() -> ConnectionManager {
    ConnectionManager::new(Duration::from_secs(2), Duration::from_millis(20))
}

#[tokio::test]
async fn remote_endpoints_behave_like_local_ones() {
    let host = start(HostOptions {
        buffer_size: 2,
        ..HostOptions::default()
    })
    .await;
    let conns = manager();
    let w = conns.writer(&host.infos[0].writer_refs[0]).await.unwrap();
    let r = conns.reader(&host.infos[0].reader_refs[0]).await.unwrap();

    w.write_value(json!("A")).await.unwrap();
    w.write_value(json!("B")).await.unwrap();

    // the third write blocks until a read frees space
    let w2 = w.clone();
    let blocked = tokio::spawn(async move { w2.write_value(json!("C")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    assert_eq!(r.read().await.unwrap(), Msg::value("A"));
    blocked.await.unwrap().unwrap();
    assert_eq!(r.read().await.unwrap(), Msg::value("B"));
    assert_eq!(r.read().await.unwrap(), Msg::value("C"));

    w.write_done().await.unwrap();
    assert!(r.read().await.unwrap().is_done());
    assert!(r.read().await.unwrap().is_done());

    r.close().await.unwrap();
    assert_eq!(r.close().await, Err(ChannelError::HandleClosed));
    assert_eq!(w.close().await, Err(ChannelError::HandleClosed));
    host.stop().await;
}

#[tokio::test]
async fn blocked_read_does_not_block_the_connection() {
    let host = start(HostOptions::default()).await;
    let conns = manager();
    let r = conns.reader(&host.infos[0].reader_refs[0]).await.unwrap();
    let w = conns.writer(&host.infos[0].writer_refs[0]).await.unwrap();

    let r2 = r.clone();
    let pending = tokio::spawn(async move { r2.read().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    w.write_value(json!(42)).await.unwrap();
    assert_eq!(pending.await.unwrap().unwrap(), Msg::value(42));
    host.stop().await;
}

#[tokio::test]
async fn unknown_tokens_and_wrong_kinds_are_refused() {
    let host = start(HostOptions::default()).await;
    let conns = manager();
    let reader_ref = &host.infos[0].reader_refs[0];
    let sr: fbp_channel::SturdyRef = reader_ref.parse().unwrap();

    let unknown = format!("fbp://{}/nobody", sr.addr());
    assert!(matches!(
        conns.reader(&unknown).await,
        Err(ChannelError::UnknownEndpoint(_))
    ));
    assert!(matches!(
        conns.writer(reader_ref).await,
        Err(ChannelError::Protocol(_))
    ));
    host.stop().await;
}

#[tokio::test]
async fn reports_reach_the_negotiator() {
    let bootstrap = start(HostOptions::bootstrap("127.0.0.1")).await;
    let conns = manager();
    let report_reader = conns
        .reader(&bootstrap.infos[0].reader_refs[0])
        .await
        .unwrap();
    let negotiator = Negotiator::start(report_reader);

    let host = ChannelHost::bind(HostOptions {
        no_of_channels: 3,
        ..HostOptions::default()
    })
    .await
    .unwrap();
    host.report(&conns, &bootstrap.infos[0].writer_refs[0], "link-1")
        .await
        .unwrap();

    let infos = negotiator
        .request("link-1", 3, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(infos, host.startup_infos());
    bootstrap.stop().await;
}

#[tokio::test]
async fn report_writer_carries_startup_reports() {
    let bootstrap = start(HostOptions::bootstrap("127.0.0.1")).await;
    let conns = manager();
    let w = conns.writer(&bootstrap.infos[0].writer_refs[0]).await.unwrap();
    let r = conns.reader(&bootstrap.infos[0].reader_refs[0]).await.unwrap();
    let report = StartupReport::new("x", bootstrap.infos[0].clone());
    w.write(report.to_msg().unwrap()).await.unwrap();
    let ip = r.read().await.unwrap().into_ip().unwrap();
    assert_eq!(StartupReport::from_ip(&ip).unwrap(), report);
    bootstrap.stop().await;
}

#[tokio::test]
async fn ports_connect_from_port_infos() {
    let config = start(HostOptions::default()).await;
    let links = start(HostOptions {
        no_of_channels: 3,
        buffer_size: 4,
        ..HostOptions::default()
    })
    .await;
    let conns = manager();

    let port_infos = PortInfos {
        in_ports: vec![NamedPortRef::single("in", links.infos[0].reader_refs[0].clone())],
        out_ports: vec![NamedPortRef::array(
            "out",
            vec![
                links.infos[1].writer_refs[0].clone(),
                links.infos[2].writer_refs[0].clone(),
            ],
        )],
    };
    let pi_writer = conns.writer(&config.infos[0].writer_refs[0]).await.unwrap();
    pi_writer.write(port_infos.to_msg().unwrap()).await.unwrap();

    let ports = Ports::from_port_infos_reader(&conns, &config.infos[0].reader_refs[0], &["in"], &["out"])
        .await
        .unwrap();
    let out = ports.out_port("out").unwrap();
    assert_eq!(out.len(), 2);

    let upstream = conns.writer(&links.infos[0].writer_refs[0]).await.unwrap();
    upstream.write_value(json!("copy me")).await.unwrap();
    let msg = ports.in_port("in").unwrap().read().await.unwrap();
    out.write(msg).await.unwrap();
    ports.close_out_ports().await.unwrap();

    for info in &links.infos[1..] {
        let r = conns.reader(&info.reader_refs[0]).await.unwrap();
        assert_eq!(r.read().await.unwrap(), Msg::value("copy me"));
        assert!(r.read().await.unwrap().is_done());
    }
    config.stop().await;
    links.stop().await;
}

#[tokio::test]
async fn immediate_policy_drops_buffer_on_shutdown() {
    let host = ChannelHost::bind(HostOptions {
        buffer_size: 3,
        close_policy: fbp_channel::ClosePolicy::Immediate,
        ..HostOptions::default()
    })
    .await
    .unwrap();
    let channel = host.channels()[0].clone();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(host.serve(async move {
        let _ = stopped.await;
    }));

    let writer = channel.create_writer().unwrap();
    writer.write(Msg::value(1)).await.unwrap();
    let _ = stop.send(());
    task.await.unwrap();
    assert_eq!(channel.state(), fbp_channel::ChannelState::Closed);
}
