use std::collections::HashSet;

use fbp_channel::{Channel, ChannelState, Msg};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn single_reader_sees_write_order(
        capacity in 1usize..6,
        values in prop::collection::vec(any::<i64>(), 0..40)
    ) {
        let got = runtime().block_on(async {
            let chan = Channel::new(capacity);
            let r = chan.create_reader().unwrap();
            let w = chan.create_writer().unwrap();
            let to_send = values.clone();
            let producer = tokio::spawn(async move {
                for v in to_send {
                    w.write(Msg::value(v)).await.unwrap();
                }
                w.write(Msg::Done).await.unwrap();
            });
            let mut got = Vec::new();
            loop {
                match r.read().await.unwrap() {
                    Msg::Value(ip) => {
                        assert!(chan.len() <= capacity);
                        got.push(ip.content.as_i64().unwrap());
                    }
                    Msg::Done => break,
                }
            }
            producer.await.unwrap();
            got
        });
        prop_assert_eq!(got, values);
    }

    #[test]
    fn every_value_reaches_exactly_one_reader(
        capacity in 1usize..4,
        writers in 1usize..4,
        readers in 1usize..4,
        per_writer in 0usize..15
    ) {
        let (seen, dones, state) = runtime().block_on(async {
            let chan = Channel::new(capacity);
            let reader_tasks: Vec<_> = (0..readers)
                .map(|_| {
                    let r = chan.create_reader().unwrap();
                    tokio::spawn(async move {
                        let mut got = Vec::new();
                        loop {
                            match r.read().await.unwrap() {
                                Msg::Value(ip) => got.push(ip.content.as_u64().unwrap()),
                                Msg::Done => return got,
                            }
                        }
                    })
                })
                .collect();
            let writer_tasks: Vec<_> = (0..writers)
                .map(|wi| {
                    let w = chan.create_writer().unwrap();
                    tokio::spawn(async move {
                        for i in 0..per_writer {
                            w.write(Msg::value((wi * 1000 + i) as u64)).await.unwrap();
                        }
                        w.close().unwrap();
                    })
                })
                .collect();
            for t in writer_tasks {
                t.await.unwrap();
            }
            let mut seen = Vec::new();
            let mut dones = 0;
            for t in reader_tasks {
                seen.extend(t.await.unwrap());
                dones += 1;
            }
            (seen, dones, chan.state())
        });

        prop_assert_eq!(seen.len(), writers * per_writer);
        let unique: HashSet<_> = seen.iter().copied().collect();
        prop_assert_eq!(unique.len(), seen.len());
        prop_assert_eq!(dones, readers);
        prop_assert_eq!(state, ChannelState::Drained);
    }
}
