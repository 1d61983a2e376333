tonic::include_proto!("forwarding");
