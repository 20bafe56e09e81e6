use std::env;

use once_cell::sync::OnceCell;
use rbatis::RBatis;
use rbdc_mysql::MysqlDriver;

static DB_CLIENT: OnceCell<RBatis> = OnceCell::new();

/// 初始化全局数据库连接，进程生命周期内只调用一次
pub async fn init_db() -> &'static RBatis {
    let rb = RBatis::new();
    rb.link(MysqlDriver {}, &env::var("DB_HOST").expect("DB_HOST config is none"))
        .await
        .expect("Failed to connect db");
    //这里建议 需要调整数据库的最大连接数
    if let Ok(pool) = rb.get_pool() {
        pool.set_max_open_conns(100).await;
    }

    DB_CLIENT.set(rb).expect("Failed to set DB_CLIENT");
    DB_CLIENT.get().expect("DB_CLIENT is not initialized")
}

pub fn get_db_client() -> &'static RBatis {
    DB_CLIENT.get().expect("DB_CLIENT is not initialized")
}
