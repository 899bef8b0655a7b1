#[rocket::launch]
fn rocket() -> _ {
    shop_api::rocket()
}
